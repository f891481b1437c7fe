pub mod message_queue;
pub mod queue;
