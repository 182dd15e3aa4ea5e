pub mod proximal;

pub use proximal::{ProximalObjective, ProximalSolution, SmoothTerm, proximal_newton};
