use serde::{Serialize,Deserialize};
use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
};

/// Identifies a listener within one [`ListenerCollection`](crate::ListenerCollection).
#[derive(Clone,Copy,Debug,PartialEq,Eq,Hash,PartialOrd,Ord,Serialize,Deserialize)]
pub struct ListenerId(i64);

/// Identifies a connection accepted by a particular listener.
#[derive(Clone,Copy,Debug,PartialEq,Eq,Hash,PartialOrd,Ord,Serialize,Deserialize)]
pub struct ConnectionId(ListenerId, i64);

impl ListenerId
{
    pub fn local(&self) -> i64
    {
        self.0
    }
}

impl ConnectionId
{
    pub fn listener(&self) -> ListenerId
    {
        self.0
    }

    pub fn local(&self) -> i64
    {
        self.1
    }
}

impl fmt::Display for ListenerId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for ConnectionId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}.{}", self.0, self.1)
    }
}

pub struct ListenerIdGenerator(AtomicI64);

impl ListenerIdGenerator
{
    pub fn new(start: i64) -> Self
    {
        Self(AtomicI64::new(start))
    }

    pub fn next(&self) -> ListenerId
    {
        ListenerId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct ConnectionIdGenerator
{
    listener: ListenerId,
    next: AtomicI64,
}

impl ConnectionIdGenerator
{
    pub fn new(listener: ListenerId, start: i64) -> Self
    {
        Self { listener, next: AtomicI64::new(start) }
    }

    pub fn next(&self) -> ConnectionId
    {
        ConnectionId(self.listener, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn connection_ids_are_scoped_to_their_listener()
    {
        let listeners = ListenerIdGenerator::new(1);
        let first = listeners.next();
        let second = listeners.next();
        assert_ne!(first, second);

        let connections = ConnectionIdGenerator::new(second, 1);
        let a = connections.next();
        let b = connections.next();
        assert_eq!(a.listener(), second);
        assert_eq!(b.local(), a.local() + 1);
        assert_eq!(b.to_string(), "L2.2");
    }
}
