//! # Petri 网核心定义
//!
//! 设库所集合 `P` 与迁移集合 `T`. 每条流关系连接一个库所与一个迁移, 带一个令牌约束.
//! 对标识 `M` 与迁移 `t`:
//!
//! * `t` **使能** 当且仅当 `M - Pre(t) ≥ 0` (着色库所按颜色逐项比较),
//!   且 `M - Pre(t) + Post(t)` 不超过任何库所的总容量与颜色容量;
//! * `t` **发生** 后 `M' = M - Pre(t) + Post(t)`. 发生是原子的, 失败时标识不变.
//!
//! 着色网中普通计数约束 `n` 表示 `n` 个控制流颜色 (`"black"`) 的令牌;
//! 迁移上的 [`FiringRule`] 可按库所、按颜色覆盖约束.
//!
//! ## 示例
//!
//! ```rust
//! use pn_analysis::net::*;
//!
//! let mut net = Net::empty();
//! let p0 = net.add_place(Place::with_capacity("p0", 1)).unwrap();
//! let p1 = net.add_place(Place::with_capacity("p1", 1)).unwrap();
//! let t0 = net.add_transition(Transition::new("t0")).unwrap();
//! net.add_flow_relation("p0", "t0", 1).unwrap();
//! net.add_flow_relation("t0", "p1", 1).unwrap();
//! net.set_initial_marking(net.marking_from_counts(&[("p0", 1)]).unwrap()).unwrap();
//!
//! let marking = net.initial_marking();
//! assert_eq!(net.enabled_transitions(marking), vec![t0]);
//! let next = net.fire_transition(marking, t0).unwrap();
//! assert_eq!(next.tokens(p0), 0);
//! assert_eq!(next.tokens(p1), 1);
//! ```

pub mod core;
pub mod events;
pub mod ids;
pub mod index_vec;
pub mod io;
pub mod live;
pub mod structure;
pub mod tokens;

pub use core::{DisabledReason, FireError, FiringValidator, Net, NetError};
pub use events::{
    ListenerId, PlaceEvent, PlaceEventKind, PlaceListener, TransitionEvent, TransitionEventKind, TransitionListener,
};
pub use ids::{PlaceId, RelationId, TransitionId};
pub use index_vec::{Idx, IndexVec};
pub use live::PetriNet;
pub use structure::{ArcDirection, FiringRule, FlowRelation, NetKind, Place, Transition};
pub use tokens::{CONTROL_FLOW_COLOR, Color, Constraint, Marking, Multiset, TokenContainer, Weight};
