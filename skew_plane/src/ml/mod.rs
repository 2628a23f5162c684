pub mod autodiff;
pub mod block;
mod layer;
pub mod lstm;
mod random;
pub mod seq;
pub mod serial;
pub mod skew;
pub mod solver;

pub use layer::*;
pub use random::*;
