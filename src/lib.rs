pub mod command;
pub mod egress;
pub mod fraction;
pub mod ingress;
pub mod message;
pub mod pipeline;
pub mod settings;
pub mod supervisor;
