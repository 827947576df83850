//! 带当前标识的可执行网.
//!
//! [`PetriNet`] 持有结构网 [`Net`]、当前标识以及由标识派生的使能标记.
//! 每次结构变化或令牌移动之后重新计算使能状态, 并向监听器同步发出
//! `Enabled` / `Disabled` 事件; 发生成功时在返回前发出 `Fired` 事件.
//! 库所监听器在令牌变化 (先于 `Fired`) 与容量变化时收到 [`PlaceEvent`].
use std::sync::Arc;

use rand::Rng;
use rand::seq::IndexedRandom;

use crate::net::core::{FireError, FiringValidator, Net, NetError};
use crate::net::events::{
    ListenerId, ListenerSupport, PlaceEvent, PlaceEventKind, PlaceListener, TransitionEvent,
    TransitionEventKind, TransitionListener,
};
use crate::net::ids::{PlaceId, RelationId, TransitionId};
use crate::net::index_vec::IndexVec;
use crate::net::structure::{FiringRule, FlowRelation, NetKind, Place, Transition};
use crate::net::tokens::{Constraint, Marking, Weight};

#[derive(Debug)]
pub struct PetriNet {
    net: Net,
    marking: Marking,
    enabled: IndexVec<TransitionId, bool>,
    listeners: ListenerSupport<TransitionEvent>,
    place_listeners: ListenerSupport<PlaceEvent>,
}

impl PetriNet {
    pub fn new(name: impl Into<String>, kind: NetKind) -> Self {
        Self::from_net(Net::new(name, kind))
    }

    /// 以网的初始标识作为当前标识.
    pub fn from_net(net: Net) -> Self {
        let marking = net.initial_marking().clone();
        let enabled = net
            .transitions
            .indices()
            .map(|transition| net.is_enabled(transition, &marking))
            .collect();
        Self {
            net,
            marking,
            enabled,
            listeners: ListenerSupport::new(),
            place_listeners: ListenerSupport::new(),
        }
    }

    pub fn net(&self) -> &Net {
        &self.net
    }

    pub fn marking(&self) -> &Marking {
        &self.marking
    }

    pub fn add_place(&mut self, place: Place) -> Result<PlaceId, NetError> {
        let place_id = self.net.add_place(place)?;
        self.marking.push(self.net.kind.empty_container());
        self.check_state();
        Ok(place_id)
    }

    pub fn add_transition(&mut self, transition: Transition) -> Result<TransitionId, NetError> {
        let transition_id = self.net.add_transition(transition)?;
        self.check_state();
        Ok(transition_id)
    }

    pub fn add_flow_relation(
        &mut self,
        from: &str,
        to: &str,
        constraint: impl Into<Constraint>,
    ) -> Result<RelationId, NetError> {
        let relation = self.net.add_flow_relation(from, to, constraint)?;
        self.check_state();
        Ok(relation)
    }

    pub fn remove_flow_relation(&mut self, relation: RelationId) -> Result<FlowRelation, NetError> {
        let removed = self.net.remove_flow_relation(relation)?;
        self.check_state();
        Ok(removed)
    }

    pub fn set_capacity(&mut self, place: PlaceId, capacity: Option<Weight>) -> Result<(), NetError> {
        self.ensure_live_marking_fits(place, |place| place.capacity = capacity)?;
        let before = self.net.places[place].capacity;
        self.net.set_capacity(place, capacity)?;
        if before != capacity {
            self.notify_place(place, PlaceEventKind::CapacityChanged {
                color: None,
                before,
                after: capacity,
            });
        }
        self.check_state();
        Ok(())
    }

    pub fn set_color_capacity(&mut self, place: PlaceId, color: &str, capacity: Weight) -> Result<(), NetError> {
        self.ensure_live_marking_fits(place, |place| {
            place.color_capacity.insert(color.to_string(), capacity);
        })?;
        let before = self.net.places[place].color_capacity.get(color).copied();
        self.net.set_color_capacity(place, color, capacity)?;
        if before != Some(capacity) {
            self.notify_place(place, PlaceEventKind::CapacityChanged {
                color: Some(color.to_string()),
                before,
                after: Some(capacity),
            });
        }
        self.check_state();
        Ok(())
    }

    fn ensure_live_marking_fits(&self, place: PlaceId, update: impl FnOnce(&mut Place)) -> Result<(), NetError> {
        let mut candidate = self
            .net
            .get_place(place)
            .cloned()
            .ok_or(NetError::UnknownPlace(place))?;
        update(&mut candidate);
        if candidate.admits(self.marking.container(place)) {
            Ok(())
        } else {
            Err(NetError::InvalidMarking(format!(
                "current tokens of `{}` exceed the new capacity",
                candidate.name
            )))
        }
    }

    /// 设置初始标识, 当前标识随之重置.
    pub fn set_initial_marking(&mut self, marking: Marking) -> Result<(), NetError> {
        self.net.set_initial_marking(marking.clone())?;
        self.move_to(marking);
        self.check_state();
        Ok(())
    }

    pub fn set_firing_rule(&mut self, transition: TransitionId, rule: FiringRule) -> Result<(), NetError> {
        self.net.set_firing_rule(transition, rule)?;
        self.check_state();
        Ok(())
    }

    pub fn add_validator(&mut self, transition: TransitionId, validator: Arc<FiringValidator>) {
        self.net.add_validator(transition, validator);
    }

    pub fn is_enabled(&self, transition: TransitionId) -> bool {
        self.enabled.get(transition).copied().unwrap_or(false)
    }

    pub fn enabled_transitions(&self) -> Vec<TransitionId> {
        self.enabled
            .iter_enumerated()
            .filter_map(|(transition, enabled)| enabled.then_some(transition))
            .collect()
    }

    pub fn fire(&mut self, transition: TransitionId) -> Result<(), FireError> {
        let next = self.net.fire_transition(&self.marking, transition)?;
        self.move_to(next);
        log::trace!("fired {:?}, marking now {:?}", transition, self.marking);

        let event = TransitionEvent {
            transition,
            name: self.net.transitions[transition].name.clone(),
            kind: TransitionEventKind::Fired,
        };
        self.listeners.notify(&event);
        self.check_state();
        Ok(())
    }

    pub fn fire_by_name(&mut self, name: &str) -> Result<(), FireError> {
        let transition = self
            .net
            .transition_id(name)
            .ok_or_else(|| FireError::UnknownTransition(name.to_string()))?;
        self.fire(transition)
    }

    /// 在使能迁移中均匀随机选择一个发生; 没有使能迁移时返回 `Ok(None)`.
    pub fn fire_next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<Option<TransitionId>, FireError> {
        let enabled = self.enabled_transitions();
        let Some(transition) = enabled.choose(rng).copied() else {
            return Ok(None);
        };
        self.fire(transition)?;
        Ok(Some(transition))
    }

    /// 回到初始标识.
    pub fn reset(&mut self) {
        self.move_to(self.net.initial_marking().clone());
        self.check_state();
    }

    pub fn add_transition_listener(
        &mut self,
        transition: TransitionId,
        listener: Box<TransitionListener>,
    ) -> ListenerId {
        self.listeners.add(transition, listener)
    }

    pub fn remove_transition_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn add_place_listener(&mut self, place: PlaceId, listener: Box<PlaceListener>) -> ListenerId {
        self.place_listeners.add(place, listener)
    }

    pub fn remove_place_listener(&mut self, id: ListenerId) -> bool {
        self.place_listeners.remove(id)
    }

    /// 冻结当前结构, 并以当前标识作为初始标识. 分析总是在快照上进行.
    ///
    /// 当前标识只经由已检查的操作改变 (发生、重置、设置初始标识, 容量收紧前
    /// 先检查当前标识), 因此总是该网的合法标识.
    pub fn snapshot(&self) -> Arc<Net> {
        let mut net = self.net.clone();
        net.adopt_reached_marking(self.marking.clone());
        Arc::new(net)
    }

    /// 替换当前标识, 并按库所顺序对令牌有变化的库所发出事件.
    fn move_to(&mut self, next: Marking) {
        let previous = std::mem::replace(&mut self.marking, next);
        if self.place_listeners.is_empty() {
            return;
        }
        for (place, before) in previous.iter() {
            let after = self.marking.container(place);
            if before == after {
                continue;
            }
            let event = PlaceEvent {
                place,
                name: self.net.places[place].name.clone(),
                kind: PlaceEventKind::TokensChanged {
                    before: before.clone(),
                    after: after.clone(),
                },
            };
            self.place_listeners.notify(&event);
        }
    }

    fn notify_place(&mut self, place: PlaceId, kind: PlaceEventKind) {
        let event = PlaceEvent {
            place,
            name: self.net.places[place].name.clone(),
            kind,
        };
        self.place_listeners.notify(&event);
    }

    /// 重新计算所有迁移的使能状态, 并对状态变化发出事件.
    fn check_state(&mut self) {
        for transition in self.net.transitions.indices() {
            let now = self.net.is_enabled(transition, &self.marking);
            let Some(before) = self.enabled.get(transition).copied() else {
                self.enabled.push(now);
                continue;
            };
            if before == now {
                continue;
            }
            self.enabled[transition] = now;
            let kind = if now {
                TransitionEventKind::Enabled
            } else {
                TransitionEventKind::Disabled
            };
            let event = TransitionEvent {
                transition,
                name: self.net.transitions[transition].name.clone(),
                kind,
            };
            self.listeners.notify(&event);
        }
    }
}

impl From<Net> for PetriNet {
    fn from(net: Net) -> Self {
        Self::from_net(net)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::net::tokens::TokenContainer;

    /// p0(1) -t0-> p1 -t1-> p0
    fn build_cycle() -> PetriNet {
        let mut net = PetriNet::new("cycle", NetKind::PlaceTransition);
        net.add_place(Place::new("p0")).unwrap();
        net.add_place(Place::new("p1")).unwrap();
        net.add_transition(Transition::new("t0")).unwrap();
        net.add_transition(Transition::new("t1")).unwrap();
        net.add_flow_relation("p0", "t0", 1).unwrap();
        net.add_flow_relation("t0", "p1", 1).unwrap();
        net.add_flow_relation("p1", "t1", 1).unwrap();
        net.add_flow_relation("t1", "p0", 1).unwrap();
        let marking = net.net().marking_from_counts(&[("p0", 1)]).unwrap();
        net.set_initial_marking(marking).unwrap();
        net
    }

    #[test]
    fn fire_moves_tokens_and_updates_enabling() {
        let mut net = build_cycle();
        let t0 = TransitionId::new(0);
        let t1 = TransitionId::new(1);
        assert_eq!(net.enabled_transitions(), vec![t0]);

        net.fire(t0).unwrap();
        assert_eq!(net.marking().tokens(PlaceId::new(0)), 0);
        assert_eq!(net.marking().tokens(PlaceId::new(1)), 1);
        assert_eq!(net.enabled_transitions(), vec![t1]);

        let before = net.marking().clone();
        let err = net.fire(t0).unwrap_err();
        assert!(err.is_invalid_operation());
        assert_eq!(net.marking(), &before);

        net.reset();
        assert!(net.is_enabled(t0));
    }

    #[test]
    fn listeners_observe_fired_before_enabling_changes() {
        let mut net = build_cycle();
        let t0 = TransitionId::new(0);
        let t1 = TransitionId::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        for transition in [t0, t1] {
            let log = Arc::clone(&log);
            net.add_transition_listener(
                transition,
                Box::new(move |event: &TransitionEvent| {
                    log.lock().unwrap().push((event.name.clone(), event.kind));
                }),
            );
        }

        net.fire(t0).unwrap();
        let seen = log.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("t0".to_string(), TransitionEventKind::Fired),
                ("t0".to_string(), TransitionEventKind::Disabled),
                ("t1".to_string(), TransitionEventKind::Enabled),
            ]
        );
    }

    #[test]
    fn removed_listener_is_silent() {
        let mut net = build_cycle();
        let t0 = TransitionId::new(0);
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let id = net.add_transition_listener(
            t0,
            Box::new(move |_: &TransitionEvent| *counter.lock().unwrap() += 1),
        );
        assert!(net.remove_transition_listener(id));
        assert!(!net.remove_transition_listener(id));
        net.fire(t0).unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn relation_changes_trigger_recheck() {
        let mut net = build_cycle();
        let t1 = TransitionId::new(1);
        assert!(!net.is_enabled(t1));
        let arc = net
            .net()
            .find_relation(PlaceId::new(1), t1, crate::net::structure::ArcDirection::PlaceToTransition)
            .unwrap();
        net.remove_flow_relation(arc).unwrap();
        assert!(net.is_enabled(t1));
    }

    #[test]
    fn snapshot_freezes_live_marking() {
        let mut net = build_cycle();
        net.fire(TransitionId::new(0)).unwrap();
        let snapshot = net.snapshot();
        assert_eq!(snapshot.initial_marking(), net.marking());
        net.fire(TransitionId::new(1)).unwrap();
        assert_ne!(snapshot.initial_marking(), net.marking());
    }

    #[test]
    fn snapshot_after_capacity_tightening_is_a_valid_net() {
        let mut net = build_cycle();
        net.fire(TransitionId::new(0)).unwrap();
        net.set_capacity(PlaceId::new(1), Some(1)).unwrap();
        let snapshot = net.snapshot();
        assert_eq!(snapshot.initial_marking(), net.marking());
        assert!(snapshot.validate().is_ok());
    }

    fn record_place_events(net: &mut PetriNet, places: &[u32]) -> Arc<Mutex<Vec<PlaceEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for place in places {
            let log = Arc::clone(&log);
            net.add_place_listener(
                PlaceId::new(*place),
                Box::new(move |event: &PlaceEvent| log.lock().unwrap().push(event.clone())),
            );
        }
        log
    }

    #[test]
    fn place_listeners_see_token_moves_before_fired() {
        let mut net = build_cycle();
        let order = Arc::new(Mutex::new(Vec::new()));
        for place in [0, 1] {
            let order = Arc::clone(&order);
            net.add_place_listener(
                PlaceId::new(place),
                Box::new(move |event: &PlaceEvent| order.lock().unwrap().push(event.name.clone())),
            );
        }
        let fired = Arc::clone(&order);
        net.add_transition_listener(
            TransitionId::new(0),
            Box::new(move |event: &TransitionEvent| fired.lock().unwrap().push(format!("{:?}", event.kind))),
        );

        net.fire(TransitionId::new(0)).unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["p0".to_string(), "p1".to_string(), "Fired".to_string(), "Disabled".to_string()]
        );
    }

    #[test]
    fn token_changes_carry_before_and_after() {
        let mut net = build_cycle();
        let log = record_place_events(&mut net, &[1]);
        net.fire(TransitionId::new(0)).unwrap();
        net.reset();
        let seen = log.lock().unwrap().clone();
        assert_eq!(
            seen.iter().map(|event| event.kind.clone()).collect::<Vec<_>>(),
            vec![
                PlaceEventKind::TokensChanged {
                    before: TokenContainer::Count(0),
                    after: TokenContainer::Count(1),
                },
                PlaceEventKind::TokensChanged {
                    before: TokenContainer::Count(1),
                    after: TokenContainer::Count(0),
                },
            ]
        );
    }

    #[test]
    fn capacity_changes_are_reported_once() {
        let mut net = build_cycle();
        let log = record_place_events(&mut net, &[1]);
        net.set_capacity(PlaceId::new(1), Some(3)).unwrap();
        net.set_capacity(PlaceId::new(1), Some(3)).unwrap();
        assert!(net.set_capacity(PlaceId::new(0), Some(0)).is_err());
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].kind,
            PlaceEventKind::CapacityChanged {
                color: None,
                before: None,
                after: Some(3),
            }
        );

        let mut colored = PetriNet::new("colored", NetKind::Colored);
        let p = colored.add_place(Place::new("p")).unwrap();
        let id = colored.add_place_listener(p, Box::new(|_: &PlaceEvent| {}));
        let log = record_place_events(&mut colored, &[0]);
        colored.set_color_capacity(p, "red", 2).unwrap();
        assert!(colored.remove_place_listener(id));
        assert_eq!(
            log.lock().unwrap()[0].kind,
            PlaceEventKind::CapacityChanged {
                color: Some("red".to_string()),
                before: None,
                after: Some(2),
            }
        );
    }

    #[test]
    fn fire_next_picks_enabled_transition() {
        let mut net = build_cycle();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let fired = net.fire_next(&mut rng).unwrap();
            assert!(fired.is_some());
            assert_eq!(net.marking().total_tokens(), 1);
        }

        let mut dead = PetriNet::new("dead", NetKind::PlaceTransition);
        dead.add_place(Place::new("p")).unwrap();
        dead.add_transition(Transition::new("t")).unwrap();
        dead.add_flow_relation("p", "t", 1).unwrap();
        assert_eq!(dead.fire_next(&mut rng).unwrap(), None);
    }

    #[test]
    fn capacity_cannot_drop_below_live_tokens() {
        let mut net = build_cycle();
        assert!(net.set_capacity(PlaceId::new(0), Some(0)).is_err());
        net.fire(TransitionId::new(0)).unwrap();
        // 初始标识仍在 p0 上有令牌.
        assert!(net.set_capacity(PlaceId::new(0), Some(0)).is_err());
        net.set_capacity(PlaceId::new(1), Some(1)).unwrap();
        assert!(net.is_enabled(TransitionId::new(1)));
    }
}
