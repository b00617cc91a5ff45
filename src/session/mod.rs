//! QUIC session resumption state

pub mod ticket;

pub use ticket::{SessionTicket, SessionTicketStore};
