//! 令牌容器、流关系约束与标识.
//!
//! P/T 网的库所保存一个计数, 着色网的库所保存一个颜色多重集. 多重集使用有序映射,
//! 且从不保存计数为 0 的条目, 因此相等的令牌内容总有相同的表示与哈希值,
//! 可直接作为可达图去重的键.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::net::ids::PlaceId;
use crate::net::index_vec::IndexVec;

pub type Weight = u64;
pub type Color = String;

/// 着色网中普通计数约束所对应的控制流令牌颜色.
pub const CONTROL_FLOW_COLOR: &str = "black";

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Multiset(BTreeMap<Color, Weight>);

/// 反序列化时丢弃计数为 0 的条目, 保持规范表示.
impl<'de> Deserialize<'de> for Multiset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<Color, Weight>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

impl Multiset {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// `count` 个控制流令牌.
    pub fn control_flow(count: Weight) -> Self {
        let mut set = Self::new();
        set.add(CONTROL_FLOW_COLOR, count);
        set
    }

    /// 加入 `count` 个令牌, 计数在 `Weight::MAX` 处饱和.
    pub fn add(&mut self, color: impl Into<Color>, count: Weight) {
        if count == 0 {
            return;
        }
        let entry = self.0.entry(color.into()).or_insert(0);
        *entry = entry.saturating_add(count);
    }

    pub fn with(mut self, color: impl Into<Color>, count: Weight) -> Self {
        self.add(color, count);
        self
    }

    pub fn count(&self, color: &str) -> Weight {
        self.0.get(color).copied().unwrap_or(0)
    }

    pub fn total(&self) -> Weight {
        self.0.values().fold(0, |total, count| total.saturating_add(*count))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn colors(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Weight)> {
        self.0.iter().map(|(color, count)| (color.as_str(), *count))
    }

    /// `other ⊆ self` (按颜色逐项比较).
    pub fn contains(&self, other: &Multiset) -> bool {
        other.iter().all(|(color, count)| self.count(color) >= count)
    }

    /// 多重集差. 仅当 `other ⊆ self` 时返回结果.
    pub fn checked_sub(&self, other: &Multiset) -> Option<Multiset> {
        let mut result = self.clone();
        for (color, count) in other.iter() {
            let entry = result.0.get_mut(color)?;
            *entry = entry.checked_sub(count)?;
            if *entry == 0 {
                result.0.remove(color);
            }
        }
        Some(result)
    }

    /// 多重集和. 任一颜色的计数溢出时返回 `None`.
    pub fn checked_union(&self, other: &Multiset) -> Option<Multiset> {
        let mut result = self.clone();
        for (color, count) in other.iter() {
            let entry = result.0.entry(color.to_string()).or_insert(0);
            *entry = entry.checked_add(count)?;
        }
        Some(result)
    }
}

impl fmt::Debug for Multiset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl<S: Into<Color>> FromIterator<(S, Weight)> for Multiset {
    fn from_iter<It: IntoIterator<Item = (S, Weight)>>(iter: It) -> Self {
        let mut set = Multiset::new();
        for (color, count) in iter {
            set.add(color, count);
        }
        set
    }
}

/// 流关系上的令牌约束.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constraint {
    Count(Weight),
    Colored(Multiset),
}

impl Constraint {
    pub fn total(&self) -> Weight {
        match self {
            Constraint::Count(weight) => *weight,
            Constraint::Colored(set) => set.total(),
        }
    }

    /// 在着色网中的多重集解释.
    pub fn as_multiset(&self) -> Multiset {
        match self {
            Constraint::Count(weight) => Multiset::control_flow(*weight),
            Constraint::Colored(set) => set.clone(),
        }
    }
}

impl Default for Constraint {
    fn default() -> Self {
        Constraint::Count(1)
    }
}

impl From<Weight> for Constraint {
    fn from(value: Weight) -> Self {
        Constraint::Count(value)
    }
}

impl From<Multiset> for Constraint {
    fn from(value: Multiset) -> Self {
        Constraint::Colored(value)
    }
}

/// 单个库所的令牌内容.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenContainer {
    Count(Weight),
    Colored(Multiset),
}

impl TokenContainer {
    pub fn total(&self) -> Weight {
        match self {
            TokenContainer::Count(count) => *count,
            TokenContainer::Colored(set) => set.total(),
        }
    }

    pub fn count(&self, color: &str) -> Weight {
        match self {
            TokenContainer::Count(count) if color == CONTROL_FLOW_COLOR => *count,
            TokenContainer::Count(_) => 0,
            TokenContainer::Colored(set) => set.count(color),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn is_colored(&self) -> bool {
        matches!(self, TokenContainer::Colored(_))
    }

    /// 移除约束所要求的令牌; 令牌不足时返回 `None`.
    pub fn checked_remove(&self, constraint: &Constraint) -> Option<TokenContainer> {
        match (self, constraint) {
            (TokenContainer::Count(count), Constraint::Count(weight)) => {
                count.checked_sub(*weight).map(TokenContainer::Count)
            }
            (TokenContainer::Count(_), Constraint::Colored(_)) => None,
            (TokenContainer::Colored(set), constraint) => set
                .checked_sub(&constraint.as_multiset())
                .map(TokenContainer::Colored),
        }
    }

    /// 加入约束所产生的令牌. 计数容器不能接收带颜色的令牌, 溢出时返回 `None`.
    pub fn checked_add(&self, constraint: &Constraint) -> Option<TokenContainer> {
        match (self, constraint) {
            (TokenContainer::Count(count), Constraint::Count(weight)) => {
                count.checked_add(*weight).map(TokenContainer::Count)
            }
            (TokenContainer::Count(_), Constraint::Colored(_)) => None,
            (TokenContainer::Colored(set), constraint) => set
                .checked_union(&constraint.as_multiset())
                .map(TokenContainer::Colored),
        }
    }
}

impl fmt::Debug for TokenContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenContainer::Count(count) => write!(f, "{}", count),
            TokenContainer::Colored(set) => fmt::Debug::fmt(set, f),
        }
    }
}

/// 全局令牌分布. 按值比较与哈希, 与所属网的实例无关.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Marking(pub IndexVec<PlaceId, TokenContainer>);

impl Marking {
    pub fn new(containers: IndexVec<PlaceId, TokenContainer>) -> Self {
        Self(containers)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlaceId, &TokenContainer)> {
        self.0.iter_enumerated()
    }

    pub fn container(&self, place: PlaceId) -> &TokenContainer {
        &self.0[place]
    }

    /// 库所中的令牌总数.
    pub fn tokens(&self, place: PlaceId) -> Weight {
        self.0[place].total()
    }

    pub fn set(&mut self, place: PlaceId, container: TokenContainer) {
        self.0[place] = container;
    }

    pub(crate) fn push(&mut self, container: TokenContainer) -> PlaceId {
        self.0.push(container)
    }

    pub fn total_tokens(&self) -> Weight {
        self.0
            .iter()
            .fold(0, |total, container| total.saturating_add(container.total()))
    }

    pub fn into_inner(self) -> IndexVec<PlaceId, TokenContainer> {
        self.0
    }
}

impl fmt::Debug for Marking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (place, container) in self.iter() {
            if !container.is_empty() {
                map.entry(&place, container);
            }
        }
        map.finish()
    }
}
