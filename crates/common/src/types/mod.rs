mod cycle_record;
mod task;
mod worker;

pub use cycle_record::*;
pub use task::*;
pub use worker::*;
