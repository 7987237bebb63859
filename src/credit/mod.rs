//! Credit based flow control: a sender consumes credits for every byte it sends, and the
//!  receivers grant new credits as they process messages. A sender that runs out of credits
//!  blocks until it gets new ones.

pub mod credit;
pub mod credit_map;

pub use credit::Credit;
pub use credit_map::CreditMap;
