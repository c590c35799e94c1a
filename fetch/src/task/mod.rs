//! This module contains the background tasks of a shard: the expiration
//! scheduler that evicts successful entries once their TTL has passed.

pub(crate) mod expiry;
