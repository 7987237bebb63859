pub mod config;
pub mod credit;
pub mod downstream;
pub mod member_addr;
pub mod message;
pub mod receiver_window;
pub mod reliable_channel;
pub mod scheduler;
pub mod sender_window;
pub mod seqno;
pub mod seqno_range;
pub mod table;
pub mod test_util;
pub mod wait;
