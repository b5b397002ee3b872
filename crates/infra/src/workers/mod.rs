//! Background consumers of the message transport.

pub mod results;

pub use results::{NormalizeHandler, RawResultHandler, start_result_consumers};
