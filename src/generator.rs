//! 参数化的示例网.
use crate::net::{Net, NetError, NetKind, Place, Transition};

/// 经典的共享资源网: `processes` 个进程各自循环经过四个阶段,
/// 进入第一阶段时占用共享库所 `r` 中的一个资源, 离开时归还.
///
/// 库所 `pi1..pi4`, 迁移 `ti1..ti4` (`i` 从 1 开始); `r` 的容量等于资源数.
pub fn shared_resource(processes: usize, resources: u64) -> Result<Net, NetError> {
    if processes < 2 {
        return Err(NetError::InvalidMarking(format!(
            "shared resource net needs at least 2 processes, got {}",
            processes
        )));
    }
    if resources == 0 {
        return Err(NetError::InvalidMarking(
            "shared resource net needs at least 1 resource".to_string(),
        ));
    }

    let mut net = Net::new(
        format!("SharedResource({},{})", processes, resources),
        NetKind::PlaceTransition,
    );
    net.add_place(Place::with_capacity("r", resources))?;
    let mut initial = vec![("r".to_string(), resources)];

    for i in 1..=processes {
        for phase in 1..=4 {
            net.add_transition(Transition::new(format!("t{}{}", i, phase)))?;
            net.add_place(Place::new(format!("p{}{}", i, phase)))?;
        }
        for phase in 1..=4 {
            let next = phase % 4 + 1;
            net.add_flow_relation(&format!("t{}{}", i, phase), &format!("p{}{}", i, phase), 1)?;
            net.add_flow_relation(&format!("p{}{}", i, phase), &format!("t{}{}", i, next), 1)?;
        }
        net.add_flow_relation("r", &format!("t{}1", i), 1)?;
        net.add_flow_relation(&format!("t{}2", i), "r", 1)?;
        initial.push((format!("p{}4", i), 1));
    }

    let counts: Vec<(&str, u64)> = initial
        .iter()
        .map(|(name, count)| (name.as_str(), *count))
        .collect();
    let marking = net.marking_from_counts(&counts)?;
    net.set_initial_marking(marking)?;
    log::debug!(
        "generated {} with {} places and {} transitions",
        net.name,
        net.places_len(),
        net.transitions_len()
    );
    Ok(net)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_four_phase_cycles() {
        let net = shared_resource(3, 2).unwrap();
        assert_eq!(net.places_len(), 13);
        assert_eq!(net.transitions_len(), 12);
        assert_eq!(net.relations().count(), 3 * 10);

        let marking = net.initial_marking();
        assert_eq!(marking.tokens(net.place_id("r").unwrap()), 2);
        let enabled: Vec<_> = net
            .enabled_transitions(marking)
            .into_iter()
            .map(|t| net.transitions[t].name.clone())
            .collect();
        assert_eq!(enabled, vec!["t11", "t21", "t31"]);
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(shared_resource(1, 1).is_err());
        assert!(shared_resource(2, 0).is_err());
    }
}
