pub mod constraints;
pub mod concrete_var;
pub mod executor;
pub mod executor_arith;
pub mod executor_flow;
pub mod executor_mov;
pub mod executor_shift;
pub mod executor_string;
pub mod executor_vector;
pub mod operators;
pub mod symbolic_var;
pub mod value;

pub use constraints::ConstraintSet;
pub use concrete_var::ConcreteVar;
pub use executor::CpuExecutor;
pub use operators::Operators;
pub use symbolic_var::SymbolicVar;
pub use value::Value;
