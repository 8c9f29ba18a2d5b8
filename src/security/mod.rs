pub mod policy;
pub mod query_guards;

pub use policy::*;
pub use query_guards::*;
