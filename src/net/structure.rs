//! 网的静态结构元素: 库所、迁移、流关系与着色网的发生规则.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::net::ids::{PlaceId, TransitionId};
use crate::net::tokens::{Color, Constraint, Multiset, TokenContainer, Weight};

/// 网的种类. 决定每个库所的令牌容器形态.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetKind {
    #[default]
    PlaceTransition,
    Colored,
}

impl NetKind {
    pub fn empty_container(self) -> TokenContainer {
        match self {
            NetKind::PlaceTransition => TokenContainer::Count(0),
            NetKind::Colored => TokenContainer::Colored(Multiset::new()),
        }
    }

    pub fn accepts(self, constraint: &Constraint) -> bool {
        match self {
            NetKind::PlaceTransition => matches!(constraint, Constraint::Count(_)),
            NetKind::Colored => true,
        }
    }

    pub fn accepts_container(self, container: &TokenContainer) -> bool {
        match self {
            NetKind::PlaceTransition => !container.is_colored(),
            NetKind::Colored => container.is_colored(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Debug)]
pub struct Place {
    pub name: String,
    /// 令牌总数上限, `None` 表示无界.
    pub capacity: Option<Weight>,
    /// 着色库所中按颜色的上限.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub color_capacity: BTreeMap<Color, Weight>,
}

impl Place {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            color_capacity: BTreeMap::new(),
        }
    }

    pub fn with_capacity(name: impl Into<String>, capacity: Weight) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(name)
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.capacity.is_some()
    }

    /// 容器内容是否满足本库所的容量限制.
    pub fn admits(&self, container: &TokenContainer) -> bool {
        if let Some(capacity) = self.capacity {
            if container.total() > capacity {
                return false;
            }
        }
        self.color_capacity
            .iter()
            .all(|(color, capacity)| container.count(color) <= *capacity)
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Transition {
    pub name: String,
    /// 可观测的活动名, 回放时与日志条目匹配.
    pub label: String,
    pub silent: bool,
}

impl Transition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            silent: false,
        }
    }

    pub fn with_label(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::new(name)
        }
    }

    pub fn silent(name: impl Into<String>) -> Self {
        Self {
            silent: true,
            ..Self::new(name)
        }
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("Transition");
        tuple.field(&self.name);
        if self.label != self.name {
            tuple.field(&self.label);
        }
        if self.silent {
            tuple.field(&"silent");
        }
        tuple.finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ArcDirection {
    PlaceToTransition,
    TransitionToPlace,
}

/// 库所与迁移之间的有向边. 方向在创建时固定.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlowRelation {
    pub place: PlaceId,
    pub transition: TransitionId,
    pub direction: ArcDirection,
    pub constraint: Constraint,
}

impl FlowRelation {
    pub fn new(
        place: PlaceId,
        transition: TransitionId,
        direction: ArcDirection,
        constraint: Constraint,
    ) -> Self {
        Self {
            place,
            transition,
            direction,
            constraint,
        }
    }

    pub fn is_input(&self) -> bool {
        self.direction == ArcDirection::PlaceToTransition
    }
}

impl fmt::Debug for FlowRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            ArcDirection::PlaceToTransition => {
                write!(f, "{:?} -{:?}-> {:?}", self.place, self.constraint, self.transition)
            }
            ArcDirection::TransitionToPlace => {
                write!(f, "{:?} -{:?}-> {:?}", self.transition, self.constraint, self.place)
            }
        }
    }
}

/// 着色网中某个迁移按库所、按颜色的消耗/产生规则.
///
/// 存在规则时, 规则中的多重集取代流关系上的普通约束; 两者的令牌总数必须一致.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiringRule {
    pub required: BTreeMap<PlaceId, Multiset>,
    pub produced: BTreeMap<PlaceId, Multiset>,
}

impl FiringRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, place: PlaceId, tokens: Multiset) -> Self {
        self.required.insert(place, tokens);
        self
    }

    pub fn produce(mut self, place: PlaceId, tokens: Multiset) -> Self {
        self.produced.insert(place, tokens);
        self
    }

    pub fn requirement(&self, place: PlaceId) -> Option<&Multiset> {
        self.required.get(&place)
    }

    pub fn production(&self, place: PlaceId) -> Option<&Multiset> {
        self.produced.get(&place)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_capacity_checks_total_and_colors() {
        let mut place = Place::with_capacity("p", 3);
        place.color_capacity.insert("red".into(), 1);

        let ok = TokenContainer::Colored(Multiset::new().with("red", 1).with("blue", 2));
        let too_many_red = TokenContainer::Colored(Multiset::new().with("red", 2));
        let too_many = TokenContainer::Colored(Multiset::new().with("blue", 4));

        assert!(place.admits(&ok));
        assert!(!place.admits(&too_many_red));
        assert!(!place.admits(&too_many));
        assert!(Place::new("q").admits(&TokenContainer::Count(u64::MAX)));
    }

    #[test]
    fn transition_label_defaults_to_name() {
        let t = Transition::new("t1");
        assert_eq!(t.label, "t1");
        assert!(!t.silent);
        assert!(Transition::silent("tau").silent);
        assert_eq!(Transition::with_label("t2", "approve").label, "approve");
    }
}
