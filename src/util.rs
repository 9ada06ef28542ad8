use fibers_tasque::{DefaultCpuTaskQueue, DefaultIoTaskQueue, TaskQueueExt};
use futures::{Future, Poll};

use crate::{Error, Result};

pub(crate) type BoxFuture<T> = Box<dyn Future<Item = T, Error = Error> + Send + 'static>;

/// Two-step sequencing of heterogeneous futures.
#[derive(Debug)]
pub(crate) enum Phase<A, B> {
    A(A),
    B(B),
}
impl<A, B> Future for Phase<A, B>
where
    A: Future<Error = Error>,
    B: Future<Error = Error>,
{
    type Item = Phase<A::Item, B::Item>;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        match self {
            Phase::A(f) => track!(f.poll()).map(|t| t.map(Phase::A)),
            Phase::B(f) => track!(f.poll()).map(|t| t.map(Phase::B)),
        }
    }
}

/// Three-step variant of `Phase`.
#[derive(Debug)]
pub(crate) enum Phase3<A, B, C> {
    A(A),
    B(B),
    C(C),
}
impl<A, B, C> Future for Phase3<A, B, C>
where
    A: Future<Error = Error>,
    B: Future<Error = Error>,
    C: Future<Error = Error>,
{
    type Item = Phase3<A::Item, B::Item, C::Item>;
    type Error = Error;

    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        match self {
            Phase3::A(f) => track!(f.poll()).map(|t| t.map(Phase3::A)),
            Phase3::B(f) => track!(f.poll()).map(|t| t.map(Phase3::B)),
            Phase3::C(f) => track!(f.poll()).map(|t| t.map(Phase3::C)),
        }
    }
}

/// Runs a blocking filesystem closure on the shared I/O task queue.
pub(crate) fn io_task<T, F>(f: F) -> BoxFuture<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    Box::new(
        DefaultIoTaskQueue
            .async_call(f)
            .map_err(Error::from)
            .and_then(|result| result),
    )
}

/// Runs a CPU-heavy closure (coding math) on the shared CPU task queue.
pub(crate) fn cpu_task<T, F>(f: F) -> BoxFuture<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    Box::new(
        DefaultCpuTaskQueue
            .async_call(f)
            .map_err(Error::from)
            .and_then(|result| result),
    )
}
