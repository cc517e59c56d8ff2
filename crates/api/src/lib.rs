//! Network surface: WebSocket sessions bound onto the channel transport, plus
//! a health route.

pub mod app;
