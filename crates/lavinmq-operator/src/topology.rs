//! Admission-time guard for replica and etcd transitions
//!
//! A LavinMQ resource is in one of four topologies derived from its replica
//! count and whether etcd endpoints are set. More than one replica without
//! etcd is never admitted, and a standalone broker without etcd must first
//! be given etcd before it can be scaled out.

use crate::crd::LavinMQSpec;
use thiserror::Error;

/// Deployment shape of a LavinMQ resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// One replica, no etcd
    Standalone,
    /// One replica with etcd; the step before scaling out
    StandaloneCoordinated,
    /// Several replicas coordinated through etcd
    Clustered,
    /// Several replicas without etcd; never admitted
    ClusteredUncoordinated,
}

impl Topology {
    pub fn of(spec: &LavinMQSpec) -> Self {
        match (spec.replicas > 1, spec.has_etcd()) {
            (false, false) => Topology::Standalone,
            (false, true) => Topology::StandaloneCoordinated,
            (true, true) => Topology::Clustered,
            (true, false) => Topology::ClusteredUncoordinated,
        }
    }
}

/// Reason a create or update is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyViolation {
    #[error("a provided etcd cluster is required for replication")]
    RequiresCoordination,

    #[error("in order to safely transition without message loss from single to multi node, first update to run the single node with etcd cluster, then update to multi node")]
    UnsafeTransition,
}

/// Check a new resource
pub fn validate_create(spec: &LavinMQSpec) -> Result<(), TopologyViolation> {
    match Topology::of(spec) {
        Topology::ClusteredUncoordinated => Err(TopologyViolation::RequiresCoordination),
        _ => Ok(()),
    }
}

/// Check a change from `old` to `new`
pub fn validate_update(old: &LavinMQSpec, new: &LavinMQSpec) -> Result<(), TopologyViolation> {
    match (Topology::of(old), Topology::of(new)) {
        (_, Topology::ClusteredUncoordinated) => Err(TopologyViolation::RequiresCoordination),
        (Topology::Standalone, Topology::Clustered) => Err(TopologyViolation::UnsafeTransition),
        _ => Ok(()),
    }
}

/// Deletion is always allowed
pub fn validate_delete() -> Result<(), TopologyViolation> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(replicas: i32, endpoints: &[&str]) -> LavinMQSpec {
        LavinMQSpec {
            replicas,
            etcd_endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_topology_of() {
        assert_eq!(Topology::of(&spec(1, &[])), Topology::Standalone);
        assert_eq!(Topology::of(&spec(1, &["e1"])), Topology::StandaloneCoordinated);
        assert_eq!(Topology::of(&spec(3, &["e1"])), Topology::Clustered);
        assert_eq!(Topology::of(&spec(2, &[])), Topology::ClusteredUncoordinated);
    }

    #[test]
    fn test_create() {
        assert_eq!(validate_create(&spec(1, &[])), Ok(()));
        assert_eq!(validate_create(&spec(3, &["e1"])), Ok(()));

        let err = validate_create(&spec(3, &[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "a provided etcd cluster is required for replication"
        );
    }

    #[test]
    fn test_update_from_standalone_to_clustered() {
        let err = validate_update(&spec(1, &[]), &spec(3, &["e1"])).unwrap_err();
        assert_eq!(err, TopologyViolation::UnsafeTransition);
        assert!(err
            .to_string()
            .ends_with("first update to run the single node with etcd cluster, then update to multi node"));
    }

    #[test]
    fn test_update_through_coordinated_step() {
        assert_eq!(validate_update(&spec(1, &[]), &spec(1, &["e1"])), Ok(()));
        assert_eq!(validate_update(&spec(1, &["e1"]), &spec(3, &["e1"])), Ok(()));
    }

    #[test]
    fn test_update_dropping_etcd_while_clustered() {
        assert_eq!(
            validate_update(&spec(3, &["e1"]), &spec(3, &[])),
            Err(TopologyViolation::RequiresCoordination)
        );
    }

    #[test]
    fn test_scale_down_and_delete() {
        assert_eq!(validate_update(&spec(3, &["e1"]), &spec(1, &["e1"])), Ok(()));
        assert_eq!(validate_update(&spec(3, &["e1"]), &spec(1, &[])), Ok(()));
        assert_eq!(validate_delete(), Ok(()));
    }
}
