// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance type selection.

use std::collections::BTreeMap;

use dispatch_cloud_driver::InstanceType;
use thiserror::Error;

use super::Container;

/// Percent of nominal RAM assumed usable by containers.
const RAM_USABLE_PERCENT: i64 = 95;

/// Instance type selection errors.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum ChooseError {
    /// No instance types are configured.
    #[error("no instance types are configured")]
    NoInstanceTypesConfigured,

    /// No configured instance type is large enough.
    #[error("constraints not satisfiable by any configured instance type ({available})")]
    ConstraintsNotSatisfiable {
        /// Names of the configured types.
        available: String,
    },
}

/// Scratch space a container needs: the sum of its `tmp` mounts.
///
/// `None` when the sum does not fit in an `i64`.
pub fn scratch_needed(container: &Container) -> Option<i64> {
    container
        .mounts
        .values()
        .filter(|m| m.kind == "tmp")
        .try_fold(0i64, |total, m| total.checked_add(m.capacity))
}

/// RAM a container needs, including cache, inflated by the usable fraction.
///
/// `None` when the result does not fit in an `i64`.
pub fn ram_needed(container: &Container) -> Option<i64> {
    let rc = &container.runtime_constraints;
    rc.ram
        .checked_add(rc.keep_cache_ram)?
        .checked_mul(100)
        .map(|n| n / RAM_USABLE_PERCENT)
}

/// Pick the cheapest instance type that fits `container`.
///
/// Ties on price go to more RAM, then more vCPUs.
pub fn choose_instance_type(
    types: &BTreeMap<String, InstanceType>,
    container: &Container,
) -> Result<InstanceType, ChooseError> {
    if types.is_empty() {
        return Err(ChooseError::NoInstanceTypesConfigured);
    }
    let unsatisfiable = || ChooseError::ConstraintsNotSatisfiable {
        available: types.keys().cloned().collect::<Vec<_>>().join(", "),
    };
    let need_ram = ram_needed(container).ok_or_else(unsatisfiable)?;
    let need_scratch = scratch_needed(container).ok_or_else(unsatisfiable)?;
    let need_vcpus = container.runtime_constraints.vcpus;
    let preemptible = container.scheduling_parameters.preemptible;

    let mut best: Option<&InstanceType> = None;
    for it in types.values() {
        if it.vcpus < need_vcpus
            || it.ram < need_ram
            || it.scratch < need_scratch
            || it.preemptible != preemptible
        {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => {
                it.price < b.price
                    || (it.price == b.price
                        && (it.ram > b.ram || (it.ram == b.ram && it.vcpus > b.vcpus)))
            }
        };
        if better {
            best = Some(it);
        }
    }

    best.cloned().ok_or_else(unsatisfiable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Mount, RuntimeConstraints, SchedulingParameters};

    const GIB: i64 = 1 << 30;

    fn it(name: &str, vcpus: i64, ram: i64, price: f64) -> InstanceType {
        InstanceType {
            name: name.into(),
            provider_type: format!("p-{}", name),
            vcpus,
            ram,
            scratch: 100 * GIB,
            price,
            preemptible: false,
        }
    }

    fn types(list: Vec<InstanceType>) -> BTreeMap<String, InstanceType> {
        list.into_iter().map(|t| (t.name.clone(), t)).collect()
    }

    fn container(vcpus: i64, ram: i64) -> Container {
        Container {
            uuid: "zzzzz-dz642-000000000000001".into(),
            runtime_constraints: RuntimeConstraints {
                vcpus,
                ram,
                keep_cache_ram: 0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_cheapest_adequate_type() {
        let types = types(vec![
            it("small", 1, 2 * GIB, 0.1),
            it("medium", 2, 4 * GIB, 0.2),
            it("large", 4, 8 * GIB, 0.4),
        ]);
        let chosen = choose_instance_type(&types, &container(2, 2 * GIB)).unwrap();
        assert_eq!(chosen.name, "medium");
    }

    #[test]
    fn test_ram_discount_applies() {
        // 4 GiB requested needs 4/0.95 GiB, which a 4 GiB type cannot give.
        let types = types(vec![it("four", 2, 4 * GIB, 0.1), it("eight", 2, 8 * GIB, 0.3)]);
        let chosen = choose_instance_type(&types, &container(1, 4 * GIB)).unwrap();
        assert_eq!(chosen.name, "eight");
    }

    #[test]
    fn test_price_tie_prefers_more_ram_then_vcpus() {
        let types = types(vec![
            it("a", 2, 4 * GIB, 0.1),
            it("b", 2, 8 * GIB, 0.1),
            it("c", 4, 8 * GIB, 0.1),
        ]);
        let chosen = choose_instance_type(&types, &container(1, GIB)).unwrap();
        assert_eq!(chosen.name, "c");
    }

    #[test]
    fn test_scratch_and_preemptible() {
        let mut spot = it("spot", 2, 4 * GIB, 0.05);
        spot.preemptible = true;
        let types = types(vec![spot, it("ondemand", 2, 4 * GIB, 0.2)]);

        let mut c = container(1, GIB);
        assert_eq!(choose_instance_type(&types, &c).unwrap().name, "ondemand");

        c.scheduling_parameters = SchedulingParameters { preemptible: true };
        assert_eq!(choose_instance_type(&types, &c).unwrap().name, "spot");

        c.mounts.insert(
            "/tmp".into(),
            Mount {
                kind: "tmp".into(),
                capacity: 200 * GIB,
            },
        );
        assert!(matches!(
            choose_instance_type(&types, &c),
            Err(ChooseError::ConstraintsNotSatisfiable { .. })
        ));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            choose_instance_type(&BTreeMap::new(), &container(1, GIB)),
            Err(ChooseError::NoInstanceTypesConfigured)
        );
        let types = types(vec![it("small", 1, GIB, 0.1)]);
        let err = choose_instance_type(&types, &container(8, GIB)).unwrap_err();
        assert!(err.to_string().contains("small"));
    }

    #[test]
    fn test_oversized_constraints_are_unsatisfiable() {
        let types = types(vec![it("small", 1, 2 * GIB, 0.1)]);
        assert!(matches!(
            choose_instance_type(&types, &container(1, i64::MAX / 50)),
            Err(ChooseError::ConstraintsNotSatisfiable { .. })
        ));

        let mut c = container(1, GIB);
        c.runtime_constraints.keep_cache_ram = i64::MAX;
        assert_eq!(ram_needed(&c), None);
        assert!(choose_instance_type(&types, &c).is_err());

        let mut c = container(1, GIB);
        for path in ["/tmp/a", "/tmp/b"] {
            c.mounts.insert(
                path.into(),
                Mount {
                    kind: "tmp".into(),
                    capacity: i64::MAX / 2 + 1,
                },
            );
        }
        assert_eq!(scratch_needed(&c), None);
        assert!(matches!(
            choose_instance_type(&types, &c),
            Err(ChooseError::ConstraintsNotSatisfiable { .. })
        ));
    }
}
