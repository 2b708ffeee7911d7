//! Runtime adapter for lambdafy.
//!
//! Runs as PID 1 of a prepared container: spawns the user program on a
//! random loopback port, bridges serverless invocations (HTTP gateway,
//! queue batches, schedule ticks) onto plain HTTP against it, and exposes a
//! loopback side-channel for publishing queue messages. Outside the
//! serverless host it exec-replaces itself with the user program.

pub mod cron;
pub mod envderef;
pub mod http;
pub mod runtime;
pub mod sqs;
