//! Phantom-typed node handles
//!
//! `add_source`, `add_transform`, and friends return a handle that carries
//! the node's id plus phantom witnesses of its port types. The witnesses are
//! what make [`PipelineBuilder::connect`](crate::builder::PipelineBuilder::connect)
//! a compile-time check: an outlet of `T` only connects to an inlet of `T`.
//!
//! Joins deliberately do not implement [`Inlet`]. Their two inputs are
//! addressed explicitly through [`JoinHandle::first`] and
//! [`JoinHandle::second`], so a join over two streams of the same item type
//! stays unambiguous instead of silently routing both into one port.

use std::marker::PhantomData;

use crate::graph::{InputPort, JoinSide, NodeId};

/// Anything that names a node in the graph under construction.
pub trait NodeRef {
    /// The referenced node's id.
    fn node_id(&self) -> &NodeId;
}

/// An output port producing items of type `T`.
pub trait Outlet<T>: NodeRef {}

/// An input port consuming items of type `T`.
pub trait Inlet<T>: NodeRef {
    /// Which port of the node this inlet addresses.
    fn port(&self) -> InputPort {
        InputPort::Primary
    }
}

/// Handle to a registered source producing `O`.
pub struct SourceHandle<O> {
    id: NodeId,
    _marker: PhantomData<fn() -> O>,
}

/// Handle to a registered transform mapping `I` to `O`.
pub struct TransformHandle<I, O> {
    id: NodeId,
    _marker: PhantomData<fn(I) -> O>,
}

/// Handle to a registered sink consuming `I`.
pub struct SinkHandle<I> {
    id: NodeId,
    _marker: PhantomData<fn(I)>,
}

/// Handle to a registered join over `L` and `R` producing `O`.
pub struct JoinHandle<L, R, O> {
    id: NodeId,
    _marker: PhantomData<fn(L, R) -> O>,
}

/// Handle to a registered aggregate mapping `I` to windowed `O`.
pub struct AggregateHandle<I, O> {
    id: NodeId,
    _marker: PhantomData<fn(I) -> O>,
}

/// One addressable input of a join.
pub struct JoinInput<T> {
    id: NodeId,
    side: JoinSide,
    _marker: PhantomData<fn(T)>,
}

impl<O> SourceHandle<O> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }
}

impl<I, O> TransformHandle<I, O> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }
}

impl<I> SinkHandle<I> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }
}

impl<L, R, O> JoinHandle<L, R, O> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The join's first (left) input.
    pub fn first(&self) -> JoinInput<L> {
        JoinInput {
            id: self.id.clone(),
            side: JoinSide::Left,
            _marker: PhantomData,
        }
    }

    /// The join's second (right) input.
    pub fn second(&self) -> JoinInput<R> {
        JoinInput {
            id: self.id.clone(),
            side: JoinSide::Right,
            _marker: PhantomData,
        }
    }
}

impl<I, O> AggregateHandle<I, O> {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }
}

impl<O> NodeRef for SourceHandle<O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<I, O> NodeRef for TransformHandle<I, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<I> NodeRef for SinkHandle<I> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<L, R, O> NodeRef for JoinHandle<L, R, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<I, O> NodeRef for AggregateHandle<I, O> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<T> NodeRef for JoinInput<T> {
    fn node_id(&self) -> &NodeId {
        &self.id
    }
}

impl<O> Outlet<O> for SourceHandle<O> {}
impl<I, O> Outlet<O> for TransformHandle<I, O> {}
impl<L, R, O> Outlet<O> for JoinHandle<L, R, O> {}
impl<I, O> Outlet<O> for AggregateHandle<I, O> {}

impl<I, O> Inlet<I> for TransformHandle<I, O> {}
impl<I> Inlet<I> for SinkHandle<I> {}
impl<I, O> Inlet<I> for AggregateHandle<I, O> {}

impl<T> Inlet<T> for JoinInput<T> {
    fn port(&self) -> InputPort {
        InputPort::Join(self.side)
    }
}

macro_rules! impl_handle_basics {
    ($name:ident < $($param:ident),+ >) => {
        impl<$($param),+> Clone for $name<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    id: self.id.clone(),
                    _marker: PhantomData,
                }
            }
        }

        impl<$($param),+> std::fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.id).finish()
            }
        }
    };
}

impl_handle_basics!(SourceHandle<O>);
impl_handle_basics!(TransformHandle<I, O>);
impl_handle_basics!(SinkHandle<I>);
impl_handle_basics!(JoinHandle<L, R, O>);
impl_handle_basics!(AggregateHandle<I, O>);

impl<T> Clone for JoinInput<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            side: self.side,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for JoinInput<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("JoinInput")
            .field(&self.id)
            .field(&self.side)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_inputs_address_distinct_ports() {
        let handle: JoinHandle<i64, i64, String> = JoinHandle::new(NodeId::from("join"));
        assert_eq!(handle.first().port(), InputPort::Join(JoinSide::Left));
        assert_eq!(handle.second().port(), InputPort::Join(JoinSide::Right));
        assert_eq!(handle.first().node_id(), handle.node_id());
    }

    #[test]
    fn test_primary_port_default() {
        let handle: SinkHandle<i64> = SinkHandle::new(NodeId::from("sink"));
        assert_eq!(Inlet::port(&handle), InputPort::Primary);
    }
}
