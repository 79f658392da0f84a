// Queue module for the NATS JetStream command feed

pub mod consumer;
pub mod nats;

pub use consumer::{
    CommandConsumer, CommandDisposition, CommandHandler, JobCommand, NatsCommandConsumer, NewJob,
};
pub use nats::NatsClient;
