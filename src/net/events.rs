//! 迁移与库所事件的监听与同步分发.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::net::ids::{PlaceId, TransitionId};
use crate::net::tokens::{Color, TokenContainer, Weight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionEventKind {
    Enabled,
    Disabled,
    Fired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub transition: TransitionId,
    pub name: String,
    pub kind: TransitionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceEventKind {
    /// 库所中的令牌发生变化 (发生、重置或设置初始标识).
    TokensChanged {
        before: TokenContainer,
        after: TokenContainer,
    },
    /// 容量上限变化. `color` 为 `None` 时表示总容量.
    CapacityChanged {
        color: Option<Color>,
        before: Option<Weight>,
        after: Option<Weight>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceEvent {
    pub place: PlaceId,
    pub name: String,
    pub kind: PlaceEventKind,
}

pub type TransitionListener = dyn FnMut(&TransitionEvent) + Send;
pub type PlaceListener = dyn FnMut(&PlaceEvent) + Send;

/// 可分发的事件, 按所属节点路由到监听器.
pub trait NetEvent {
    type Node: Copy + PartialEq;

    fn node(&self) -> Self::Node;
}

impl NetEvent for TransitionEvent {
    type Node = TransitionId;

    fn node(&self) -> TransitionId {
        self.transition
    }
}

impl NetEvent for PlaceEvent {
    type Node = PlaceId;

    fn node(&self) -> PlaceId {
        self.place
    }
}

/// 注册监听器时返回的句柄, 用于注销. 在进程内唯一.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);

impl ListenerId {
    fn fresh() -> Self {
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// 按节点登记的监听器表. 分发顺序即注册顺序.
pub struct ListenerSupport<E: NetEvent> {
    listeners: Vec<(ListenerId, E::Node, Box<dyn FnMut(&E) + Send>)>,
}

impl<E: NetEvent> Default for ListenerSupport<E> {
    fn default() -> Self {
        Self { listeners: Vec::new() }
    }
}

impl<E: NetEvent> ListenerSupport<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: E::Node, listener: Box<dyn FnMut(&E) + Send>) -> ListenerId {
        let id = ListenerId::fresh();
        self.listeners.push((id, node, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn notify(&mut self, event: &E) {
        let node = event.node();
        for (_, listened, listener) in self.listeners.iter_mut() {
            if *listened == node {
                listener(event);
            }
        }
    }
}

impl<E: NetEvent> fmt::Debug for ListenerSupport<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSupport")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place_event(place: u32) -> PlaceEvent {
        PlaceEvent {
            place: PlaceId::new(place),
            name: format!("p{place}"),
            kind: PlaceEventKind::CapacityChanged {
                color: None,
                before: None,
                after: Some(1),
            },
        }
    }

    #[test]
    fn events_reach_only_listeners_of_their_node() {
        let mut support = ListenerSupport::<PlaceEvent>::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for place in [0, 1] {
            let seen = std::sync::Arc::clone(&seen);
            support.add(
                PlaceId::new(place),
                Box::new(move |event: &PlaceEvent| seen.lock().unwrap().push(event.name.clone())),
            );
        }
        support.notify(&place_event(1));
        support.notify(&place_event(2));
        assert_eq!(*seen.lock().unwrap(), vec!["p1".to_string()]);
    }

    #[test]
    fn listener_ids_are_unique_across_tables() {
        let mut places = ListenerSupport::<PlaceEvent>::new();
        let mut transitions = ListenerSupport::<TransitionEvent>::new();
        let place_id = places.add(PlaceId::new(0), Box::new(|_: &PlaceEvent| {}));
        let transition_id = transitions.add(TransitionId::new(0), Box::new(|_: &TransitionEvent| {}));
        assert_ne!(place_id, transition_id);
        assert!(!places.remove(transition_id));
        assert_eq!(places.len(), 1);
    }
}
