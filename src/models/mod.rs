pub mod proxy;
pub mod task;
pub mod validation;

pub use proxy::*;
pub use task::*;
pub use validation::*;
