//! 结构网与发生语义: 使能判定、原子发生与可插拔的有效性检查.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::net::ids::{PlaceId, RelationId, TransitionId};
use crate::net::index_vec::IndexVec;
use crate::net::structure::{ArcDirection, FiringRule, FlowRelation, NetKind, Place, Transition};
use crate::net::tokens::{Constraint, Marking, Multiset, TokenContainer, Weight};

/// 迁移级别的有效性检查 (例如信息流网的解密约束), 在发生前调用.
pub type FiringValidator = dyn Fn(&Net, TransitionId, &Marking) -> Result<(), String> + Send + Sync;

type RelationList = SmallVec<[RelationId; 4]>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("no place or transition named `{0}`")]
    UnknownNode(String),
    #[error("a node named `{0}` already exists")]
    DuplicateName(String),
    #[error("a flow relation must connect a place and a transition: `{from}` -> `{to}`")]
    InvalidRelation { from: String, to: String },
    #[error("flow relation `{from}` -> `{to}` already exists")]
    DuplicateRelation { from: String, to: String },
    #[error("flow relation {0:?} does not exist")]
    UnknownRelation(RelationId),
    #[error("place {0:?} does not exist")]
    UnknownPlace(PlaceId),
    #[error("transition {0:?} does not exist")]
    UnknownTransition(TransitionId),
    #[error("constraint {constraint:?} does not fit a {kind:?} net")]
    ConstraintKind { constraint: Constraint, kind: NetKind },
    #[error("flow relation `{from}` -> `{to}` must move at least one token")]
    EmptyConstraint { from: String, to: String },
    #[error("invalid marking: {0}")]
    InvalidMarking(String),
    #[error("invalid firing rule for transition `{transition}`: {reason}")]
    InvalidFiringRule { transition: String, reason: String },
    #[error("inconsistent net structure: {0}")]
    InvalidStructure(String),
}

/// 迁移未使能的具体原因.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisabledReason {
    InsufficientTokens { place: PlaceId },
    CapacityExceeded {
        place: PlaceId,
        after: Weight,
        capacity: Option<Weight>,
    },
    IncompatibleTokens { place: PlaceId },
}

impl fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisabledReason::InsufficientTokens { place } => {
                write!(f, "not enough tokens in {:?}", place)
            }
            DisabledReason::CapacityExceeded {
                place,
                after,
                capacity,
            } => match capacity {
                Some(capacity) => write!(f, "capacity exceeded at {:?}: {} > {}", place, after, capacity),
                None => write!(f, "color capacity exceeded at {:?}", place),
            },
            DisabledReason::IncompatibleTokens { place } => {
                write!(f, "tokens produced for {:?} do not fit its container", place)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FireError {
    #[error("transition {0:?} is out of bounds")]
    OutOfBounds(TransitionId),
    #[error("no transition named `{0}`")]
    UnknownTransition(String),
    #[error("cannot fire transition `{name}`: not enabled ({reason})")]
    NotEnabled {
        transition: TransitionId,
        name: String,
        reason: DisabledReason,
    },
    #[error("cannot fire transition `{name}`: not in valid state [{reason}]")]
    Validation {
        transition: TransitionId,
        name: String,
        reason: String,
    },
}

impl FireError {
    /// 调用方违反了前置条件 (迁移不存在或未使能).
    pub fn is_invalid_operation(&self) -> bool {
        !self.is_structural_violation()
    }

    pub fn is_structural_violation(&self) -> bool {
        matches!(self, FireError::Validation { .. })
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Net {
    pub name: String,
    pub kind: NetKind,
    pub places: IndexVec<PlaceId, Place>,
    pub transitions: IndexVec<TransitionId, Transition>,
    relations: IndexVec<RelationId, Option<FlowRelation>>,
    inputs: IndexVec<TransitionId, RelationList>,
    outputs: IndexVec<TransitionId, RelationList>,
    initial_marking: Marking,
    #[serde(default)]
    firing_rules: BTreeMap<TransitionId, FiringRule>,
    #[serde(skip)]
    validators: FxHashMap<TransitionId, Vec<Arc<FiringValidator>>>,
}

impl fmt::Debug for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Net")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("places", &self.places)
            .field("transitions", &self.transitions)
            .field("relations", &self.relations().map(|(_, r)| r).collect::<Vec<_>>())
            .field("initial_marking", &self.initial_marking)
            .field("firing_rules", &self.firing_rules)
            .finish()
    }
}

impl Net {
    pub fn new(name: impl Into<String>, kind: NetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            places: IndexVec::new(),
            transitions: IndexVec::new(),
            relations: IndexVec::new(),
            inputs: IndexVec::new(),
            outputs: IndexVec::new(),
            initial_marking: Marking::new(IndexVec::new()),
            firing_rules: BTreeMap::new(),
            validators: FxHashMap::default(),
        }
    }

    pub fn empty() -> Self {
        Self::new("", NetKind::PlaceTransition)
    }

    pub fn colored(name: impl Into<String>) -> Self {
        Self::new(name, NetKind::Colored)
    }

    fn ensure_unique_name(&self, name: &str) -> Result<(), NetError> {
        if self.place_id(name).is_some() || self.transition_id(name).is_some() {
            return Err(NetError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    pub fn add_place(&mut self, place: Place) -> Result<PlaceId, NetError> {
        self.ensure_unique_name(&place.name)?;
        let place_id = self.places.push(place);
        self.initial_marking.push(self.kind.empty_container());
        Ok(place_id)
    }

    pub fn add_transition(&mut self, transition: Transition) -> Result<TransitionId, NetError> {
        self.ensure_unique_name(&transition.name)?;
        let transition_id = self.transitions.push(transition);
        self.inputs.push(RelationList::new());
        self.outputs.push(RelationList::new());
        Ok(transition_id)
    }

    /// 按名称添加流关系, 方向由端点类型决定.
    pub fn add_flow_relation(
        &mut self,
        from: &str,
        to: &str,
        constraint: impl Into<Constraint>,
    ) -> Result<RelationId, NetError> {
        let constraint = constraint.into();
        match (self.place_id(from), self.transition_id(to)) {
            (Some(place), Some(transition)) => self.add_input_arc(place, transition, constraint),
            _ => match (self.transition_id(from), self.place_id(to)) {
                (Some(transition), Some(place)) => {
                    self.add_output_arc(place, transition, constraint)
                }
                _ if !self.has_node(from) => Err(NetError::UnknownNode(from.to_string())),
                _ if !self.has_node(to) => Err(NetError::UnknownNode(to.to_string())),
                _ => Err(NetError::InvalidRelation {
                    from: from.to_string(),
                    to: to.to_string(),
                }),
            },
        }
    }

    /// 输入弧: place -> transition
    pub fn add_input_arc(
        &mut self,
        place: PlaceId,
        transition: TransitionId,
        constraint: impl Into<Constraint>,
    ) -> Result<RelationId, NetError> {
        self.insert_relation(FlowRelation::new(
            place,
            transition,
            ArcDirection::PlaceToTransition,
            constraint.into(),
        ))
    }

    /// 输出弧: transition -> place
    pub fn add_output_arc(
        &mut self,
        place: PlaceId,
        transition: TransitionId,
        constraint: impl Into<Constraint>,
    ) -> Result<RelationId, NetError> {
        self.insert_relation(FlowRelation::new(
            place,
            transition,
            ArcDirection::TransitionToPlace,
            constraint.into(),
        ))
    }

    fn insert_relation(&mut self, relation: FlowRelation) -> Result<RelationId, NetError> {
        let place = self
            .places
            .get(relation.place)
            .ok_or(NetError::UnknownPlace(relation.place))?;
        let transition = self
            .transitions
            .get(relation.transition)
            .ok_or(NetError::UnknownTransition(relation.transition))?;
        let (from, to) = match relation.direction {
            ArcDirection::PlaceToTransition => (place.name.clone(), transition.name.clone()),
            ArcDirection::TransitionToPlace => (transition.name.clone(), place.name.clone()),
        };

        if !self.kind.accepts(&relation.constraint) {
            return Err(NetError::ConstraintKind {
                constraint: relation.constraint,
                kind: self.kind,
            });
        }
        if relation.constraint.total() == 0 {
            return Err(NetError::EmptyConstraint { from, to });
        }
        if self.find_relation(relation.place, relation.transition, relation.direction).is_some() {
            return Err(NetError::DuplicateRelation { from, to });
        }

        let transition_id = relation.transition;
        let direction = relation.direction;
        let relation_id = self.relations.push(Some(relation));
        match direction {
            ArcDirection::PlaceToTransition => self.inputs[transition_id].push(relation_id),
            ArcDirection::TransitionToPlace => self.outputs[transition_id].push(relation_id),
        }
        log::trace!("added flow relation {:?}: {} -> {}", relation_id, from, to);
        Ok(relation_id)
    }

    pub fn remove_flow_relation(&mut self, relation_id: RelationId) -> Result<FlowRelation, NetError> {
        let relation = self
            .relations
            .get_mut(relation_id)
            .and_then(Option::take)
            .ok_or(NetError::UnknownRelation(relation_id))?;
        let list = match relation.direction {
            ArcDirection::PlaceToTransition => &mut self.inputs[relation.transition],
            ArcDirection::TransitionToPlace => &mut self.outputs[relation.transition],
        };
        list.retain(|id| *id != relation_id);

        // 发生规则中该库所的条目随关系一起失效.
        if let Some(rule) = self.firing_rules.get_mut(&relation.transition) {
            match relation.direction {
                ArcDirection::PlaceToTransition => rule.required.remove(&relation.place),
                ArcDirection::TransitionToPlace => rule.produced.remove(&relation.place),
            };
        }
        Ok(relation)
    }

    pub fn set_capacity(&mut self, place: PlaceId, capacity: Option<Weight>) -> Result<(), NetError> {
        let mut updated = self
            .places
            .get(place)
            .cloned()
            .ok_or(NetError::UnknownPlace(place))?;
        updated.capacity = capacity;
        if !updated.admits(self.initial_marking.container(place)) {
            return Err(NetError::InvalidMarking(format!(
                "initial tokens of `{}` exceed capacity {:?}",
                updated.name, capacity
            )));
        }
        self.places[place] = updated;
        Ok(())
    }

    pub fn set_color_capacity(
        &mut self,
        place: PlaceId,
        color: &str,
        capacity: Weight,
    ) -> Result<(), NetError> {
        let mut updated = self
            .places
            .get(place)
            .cloned()
            .ok_or(NetError::UnknownPlace(place))?;
        updated.color_capacity.insert(color.to_string(), capacity);
        if !updated.admits(self.initial_marking.container(place)) {
            return Err(NetError::InvalidMarking(format!(
                "initial `{}` tokens of `{}` exceed capacity {}",
                color, updated.name, capacity
            )));
        }
        self.places[place] = updated;
        Ok(())
    }

    pub fn initial_marking(&self) -> &Marking {
        &self.initial_marking
    }

    pub fn set_initial_marking(&mut self, marking: Marking) -> Result<(), NetError> {
        self.validate_marking(&marking)?;
        self.initial_marking = marking;
        Ok(())
    }

    /// 采用一个由发生规则从合法标识推导出的标识, 不再重复检查.
    pub(crate) fn adopt_reached_marking(&mut self, marking: Marking) {
        debug_assert!(self.validate_marking(&marking).is_ok());
        self.initial_marking = marking;
    }

    /// 所有库所为空的标识.
    pub fn empty_marking(&self) -> Marking {
        Marking::new(IndexVec::from_elem(self.kind.empty_container(), self.places.len()))
    }

    /// 由 `(库所名, 令牌数)` 构造标识, 未列出的库所为空.
    pub fn marking_from_counts(&self, counts: &[(&str, Weight)]) -> Result<Marking, NetError> {
        let mut marking = self.empty_marking();
        for (name, count) in counts {
            let place = self
                .place_id(name)
                .ok_or_else(|| NetError::UnknownNode(name.to_string()))?;
            let container = match self.kind {
                NetKind::PlaceTransition => TokenContainer::Count(*count),
                NetKind::Colored => TokenContainer::Colored(Multiset::control_flow(*count)),
            };
            marking.set(place, container);
        }
        self.validate_marking(&marking)?;
        Ok(marking)
    }

    pub fn validate_marking(&self, marking: &Marking) -> Result<(), NetError> {
        if marking.len() != self.places.len() {
            return Err(NetError::InvalidMarking(format!(
                "expected {} places, found {}",
                self.places.len(),
                marking.len()
            )));
        }
        for (place_id, container) in marking.iter() {
            let place = &self.places[place_id];
            if !self.kind.accepts_container(container) {
                return Err(NetError::InvalidMarking(format!(
                    "tokens of `{}` do not fit a {:?} net",
                    place.name, self.kind
                )));
            }
            if !place.admits(container) {
                return Err(NetError::InvalidMarking(format!(
                    "tokens of `{}` exceed its capacity",
                    place.name
                )));
            }
        }
        Ok(())
    }

    /// 为着色网迁移附加发生规则. 规则中的每个库所必须有对应方向的流关系,
    /// 且令牌总数与该关系的约束一致.
    pub fn set_firing_rule(&mut self, transition: TransitionId, rule: FiringRule) -> Result<(), NetError> {
        self.check_firing_rule(transition, &rule)?;
        self.firing_rules.insert(transition, rule);
        Ok(())
    }

    fn check_firing_rule(&self, transition: TransitionId, rule: &FiringRule) -> Result<(), NetError> {
        let name = self
            .transitions
            .get(transition)
            .ok_or(NetError::UnknownTransition(transition))?
            .name
            .clone();
        let invalid = |reason: String| NetError::InvalidFiringRule {
            transition: name.clone(),
            reason,
        };
        if self.kind != NetKind::Colored {
            return Err(invalid("firing rules require a colored net".to_string()));
        }

        let sides = [
            (&rule.required, ArcDirection::PlaceToTransition, "consume from"),
            (&rule.produced, ArcDirection::TransitionToPlace, "produce into"),
        ];
        for (entries, direction, verb) in sides {
            for (place, tokens) in entries {
                let place_name = self
                    .places
                    .get(*place)
                    .map(|p| p.name.clone())
                    .ok_or_else(|| invalid(format!("unknown place {:?}", place)))?;
                let relation = self
                    .find_relation(*place, transition, direction)
                    .and_then(|id| self.relation(id))
                    .ok_or_else(|| invalid(format!("cannot {} `{}` without a flow relation", verb, place_name)))?;
                if tokens.total() != relation.constraint.total() {
                    return Err(invalid(format!(
                        "rule moves {} tokens at `{}`, relation requires {}",
                        tokens.total(),
                        place_name,
                        relation.constraint.total()
                    )));
                }
            }
        }
        Ok(())
    }

    /// 检查整张网的内部一致性: 节点名唯一, 流关系端点存在且与输入/输出索引表一致,
    /// 发生规则与关系约束一致, 初始标识合法. 读入外部文件后应调用.
    pub fn validate(&self) -> Result<(), NetError> {
        let broken = |reason: String| NetError::InvalidStructure(reason);

        let mut names = FxHashMap::default();
        let node_names = self
            .places
            .iter()
            .map(|place| place.name.as_str())
            .chain(self.transitions.iter().map(|transition| transition.name.as_str()));
        for name in node_names {
            if names.insert(name, ()).is_some() {
                return Err(NetError::DuplicateName(name.to_string()));
            }
        }

        if self.inputs.len() != self.transitions.len() || self.outputs.len() != self.transitions.len() {
            return Err(broken(format!(
                "relation index covers {}/{} transitions, expected {}",
                self.inputs.len(),
                self.outputs.len(),
                self.transitions.len()
            )));
        }

        let mut listed = vec![0usize; self.relations.len()];
        let index_lists = self
            .inputs
            .iter_enumerated()
            .map(|(transition, list)| (transition, list, ArcDirection::PlaceToTransition))
            .chain(
                self.outputs
                    .iter_enumerated()
                    .map(|(transition, list)| (transition, list, ArcDirection::TransitionToPlace)),
            );
        for (transition, list, direction) in index_lists {
            for relation_id in list {
                let relation = self
                    .relation(*relation_id)
                    .ok_or_else(|| broken(format!("{:?} lists missing relation {:?}", transition, relation_id)))?;
                if relation.transition != transition || relation.direction != direction {
                    return Err(broken(format!(
                        "relation {:?} is listed under {:?} in the wrong direction or transition",
                        relation_id, transition
                    )));
                }
                listed[relation_id.0 as usize] += 1;
            }
        }

        let mut endpoints = FxHashMap::default();
        for (relation_id, relation) in self.relations() {
            if self.places.get(relation.place).is_none() {
                return Err(broken(format!(
                    "relation {:?} refers to missing place {:?}",
                    relation_id, relation.place
                )));
            }
            if self.transitions.get(relation.transition).is_none() {
                return Err(broken(format!(
                    "relation {:?} refers to missing transition {:?}",
                    relation_id, relation.transition
                )));
            }
            if !self.kind.accepts(&relation.constraint) {
                return Err(NetError::ConstraintKind {
                    constraint: relation.constraint.clone(),
                    kind: self.kind,
                });
            }
            if relation.constraint.total() == 0 {
                return Err(broken(format!("relation {:?} moves no tokens", relation_id)));
            }
            if listed[relation_id.0 as usize] != 1 {
                return Err(broken(format!(
                    "relation {:?} is indexed {} times",
                    relation_id, listed[relation_id.0 as usize]
                )));
            }
            let key = (relation.place, relation.transition, relation.direction);
            if endpoints.insert(key, relation_id).is_some() {
                return Err(broken(format!("relation {:?} duplicates an earlier relation", relation_id)));
            }
        }

        for (transition, rule) in &self.firing_rules {
            self.check_firing_rule(*transition, rule)?;
        }
        self.validate_marking(&self.initial_marking)
    }

    pub fn firing_rule(&self, transition: TransitionId) -> Option<&FiringRule> {
        self.firing_rules.get(&transition)
    }

    pub fn add_validator(&mut self, transition: TransitionId, validator: Arc<FiringValidator>) {
        self.validators.entry(transition).or_default().push(validator);
    }

    pub fn get_place(&self, place: PlaceId) -> Option<&Place> {
        self.places.get(place)
    }

    pub fn get_transition(&self, transition: TransitionId) -> Option<&Transition> {
        self.transitions.get(transition)
    }

    pub fn place_id(&self, name: &str) -> Option<PlaceId> {
        self.places.position(|place| place.name == name)
    }

    pub fn transition_id(&self, name: &str) -> Option<TransitionId> {
        self.transitions.position(|transition| transition.name == name)
    }

    fn has_node(&self, name: &str) -> bool {
        self.place_id(name).is_some() || self.transition_id(name).is_some()
    }

    pub fn places_len(&self) -> usize {
        self.places.len()
    }

    pub fn transitions_len(&self) -> usize {
        self.transitions.len()
    }

    /// 已删除的流关系返回 `None`.
    pub fn relation(&self, relation: RelationId) -> Option<&FlowRelation> {
        self.relations.get(relation)?.as_ref()
    }

    pub fn relations(&self) -> impl Iterator<Item = (RelationId, &FlowRelation)> {
        self.relations
            .iter_enumerated()
            .filter_map(|(id, relation)| relation.as_ref().map(|relation| (id, relation)))
    }

    pub fn input_relations(&self, transition: TransitionId) -> impl Iterator<Item = &FlowRelation> {
        self.inputs
            .get(transition)
            .into_iter()
            .flatten()
            .filter_map(|id| self.relation(*id))
    }

    pub fn output_relations(&self, transition: TransitionId) -> impl Iterator<Item = &FlowRelation> {
        self.outputs
            .get(transition)
            .into_iter()
            .flatten()
            .filter_map(|id| self.relation(*id))
    }

    pub fn find_relation(
        &self,
        place: PlaceId,
        transition: TransitionId,
        direction: ArcDirection,
    ) -> Option<RelationId> {
        let list = match direction {
            ArcDirection::PlaceToTransition => self.inputs.get(transition)?,
            ArcDirection::TransitionToPlace => self.outputs.get(transition)?,
        };
        list.iter()
            .copied()
            .find(|id| self.relation(*id).is_some_and(|relation| relation.place == place))
    }

    fn consumption<'a>(&'a self, transition: TransitionId, relation: &'a FlowRelation) -> Cow<'a, Constraint> {
        match self.firing_rule(transition).and_then(|rule| rule.requirement(relation.place)) {
            Some(tokens) => Cow::Owned(Constraint::Colored(tokens.clone())),
            None => Cow::Borrowed(&relation.constraint),
        }
    }

    fn production<'a>(&'a self, transition: TransitionId, relation: &'a FlowRelation) -> Cow<'a, Constraint> {
        match self.firing_rule(transition).and_then(|rule| rule.production(relation.place)) {
            Some(tokens) => Cow::Owned(Constraint::Colored(tokens.clone())),
            None => Cow::Borrowed(&relation.constraint),
        }
    }

    /// 计算 `M - Pre(t) + Post(t)` 并检查输出库所容量; 不执行有效性检查.
    pub fn successor(&self, marking: &Marking, transition: TransitionId) -> Result<Marking, DisabledReason> {
        let mut next = marking.clone();
        for relation in self.input_relations(transition) {
            let required = self.consumption(transition, relation);
            let remaining = next
                .container(relation.place)
                .checked_remove(&required)
                .ok_or(DisabledReason::InsufficientTokens {
                    place: relation.place,
                })?;
            next.set(relation.place, remaining);
        }
        for relation in self.output_relations(transition) {
            let produced = self.production(transition, relation);
            let filled = next
                .container(relation.place)
                .checked_add(&produced)
                .ok_or(DisabledReason::IncompatibleTokens {
                    place: relation.place,
                })?;
            next.set(relation.place, filled);
        }
        for relation in self.output_relations(transition) {
            let place = &self.places[relation.place];
            let container = next.container(relation.place);
            if !place.admits(container) {
                return Err(DisabledReason::CapacityExceeded {
                    place: relation.place,
                    after: container.total(),
                    capacity: place.capacity.filter(|capacity| container.total() > *capacity),
                });
            }
        }
        Ok(next)
    }

    pub fn is_enabled(&self, transition: TransitionId, marking: &Marking) -> bool {
        self.transitions.get(transition).is_some() && self.successor(marking, transition).is_ok()
    }

    /// 按插入顺序返回使能迁移.
    pub fn enabled_transitions(&self, marking: &Marking) -> Vec<TransitionId> {
        self.transitions
            .indices()
            .filter(|transition| self.is_enabled(*transition, marking))
            .collect()
    }

    pub fn check_validity(&self, transition: TransitionId, marking: &Marking) -> Result<(), FireError> {
        let Some(validators) = self.validators.get(&transition) else {
            return Ok(());
        };
        for validator in validators {
            validator(self, transition, marking).map_err(|reason| FireError::Validation {
                transition,
                name: self.transitions[transition].name.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// 在给定标识上发生迁移, 返回新标识; 原标识不变.
    pub fn fire_transition(&self, marking: &Marking, transition: TransitionId) -> Result<Marking, FireError> {
        let Some(data) = self.transitions.get(transition) else {
            return Err(FireError::OutOfBounds(transition));
        };
        let next = self
            .successor(marking, transition)
            .map_err(|reason| FireError::NotEnabled {
                transition,
                name: data.name.clone(),
                reason,
            })?;
        self.check_validity(transition, marking)?;
        Ok(next)
    }
}

impl Default for Net {
    fn default() -> Self {
        Self::empty()
    }
}
