//! Job resources.
//!
//! A job request names some of machines, processes per machine, total processes and cores.
//! `ResourceSpec::resolve` completes it into a `ResolvedResources` in two stages: first the
//! process layout (machines, processes per machine, total processes), then cores, which depend
//! on the resolved processes per machine. Unlike a plain node-count request, the total number
//! of processes may be smaller than the machines can hold, so nodes can be under-populated.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use itertools::{sorted, Itertools};
use serde::Deserialize;
use tracing::debug;
use void::Void;

use crate::error::{NegotiateError, ResourceError};
use crate::serde::integer_or_string;

/// A raw parameter value as handed over by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Integer(i64),
    Text(String),
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl FromStr for ParamValue {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::Text(s.to_string()))
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{}", value),
            Self::Text(value) => write!(f, "{:?}", value),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawParam(#[serde(deserialize_with = "integer_or_string")] ParamValue);

/// The recognized resource fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceField {
    Machines,
    ProcsPerMachine,
    TotalProcs,
    CoresPerProc,
    CoresPerMachine,
}

impl ResourceField {
    /// Accepts both the short names and the scheduler's long names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "machines" | "num_machines" => Some(Self::Machines),
            "procs_per_machine" | "num_mpiprocs_per_machine" => Some(Self::ProcsPerMachine),
            "total_procs" | "tot_num_mpiprocs" => Some(Self::TotalProcs),
            "cores_per_proc" | "num_cores_per_mpiproc" => Some(Self::CoresPerProc),
            "cores_per_machine" | "num_cores_per_machine" => Some(Self::CoresPerMachine),
            _ => None,
        }
    }

    /// Scheduler name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Machines => "num_machines",
            Self::ProcsPerMachine => "num_mpiprocs_per_machine",
            Self::TotalProcs => "tot_num_mpiprocs",
            Self::CoresPerProc => "num_cores_per_mpiproc",
            Self::CoresPerMachine => "num_cores_per_machine",
        }
    }
}

impl fmt::Display for ResourceField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How to treat a requested total that reaches the full capacity of the machines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PopulationRule {
    /// Reject `total_procs >= procs_per_machine * machines`. This also rejects a request that
    /// fills every machine exactly.
    #[default]
    RejectFull,
    /// Reject only `total_procs > procs_per_machine * machines`.
    AllowFull,
}

impl PopulationRule {
    fn rejects(self, total_procs: u64, capacity: u64) -> bool {
        match self {
            Self::RejectFull => total_procs >= capacity,
            Self::AllowFull => total_procs > capacity,
        }
    }
}

/// A sparse resource request. Unset fields are derived where possible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    pub machines: Option<u64>,
    pub procs_per_machine: Option<u64>,
    pub total_procs: Option<u64>,
    pub cores_per_proc: Option<u64>,
    pub cores_per_machine: Option<u64>,
}

impl ResourceSpec {
    /// Builds a spec from named parameters. Every name must be recognized, and every value must
    /// convert to a non-negative integer.
    pub fn from_params<I, K>(params: I) -> Result<Self, ResourceError>
    where
        I: IntoIterator<Item = (K, ParamValue)>,
        K: Into<String>,
    {
        let params: Vec<(String, ParamValue)> =
            params.into_iter().map(|(k, v)| (k.into(), v)).collect();

        let unknown: Vec<String> = sorted(
            params
                .iter()
                .filter(|(name, _)| ResourceField::from_name(name).is_none())
                .map(|(name, _)| name.clone()),
        )
        .dedup()
        .collect();
        if !unknown.is_empty() {
            return Err(ResourceError::UnknownParameter(unknown));
        }

        let mut spec = Self::default();
        for (name, value) in params {
            // Checked above.
            let Some(field) = ResourceField::from_name(&name) else {
                continue;
            };
            let slot = spec.slot_mut(field);
            if slot.is_some() {
                return Err(ResourceError::InvalidResourceSpec(format!(
                    "`{}` was specified more than once.",
                    field
                )));
            }
            *slot = Some(to_count(field, &value)?);
        }
        Ok(spec)
    }

    fn slot_mut(&mut self, field: ResourceField) -> &mut Option<u64> {
        match field {
            ResourceField::Machines => &mut self.machines,
            ResourceField::ProcsPerMachine => &mut self.procs_per_machine,
            ResourceField::TotalProcs => &mut self.total_procs,
            ResourceField::CoresPerProc => &mut self.cores_per_proc,
            ResourceField::CoresPerMachine => &mut self.cores_per_machine,
        }
    }

    /// Resolves with the default `PopulationRule`.
    pub fn resolve(&self) -> Result<ResolvedResources, ResourceError> {
        self.resolve_with(PopulationRule::default())
    }

    pub fn resolve_with(&self, rule: PopulationRule) -> Result<ResolvedResources, ResourceError> {
        let resolved = self.resolve_processes(rule)?;
        let resolved = resolved.with_cores(self.cores_per_proc, self.cores_per_machine)?;
        debug!(resources = %resolved, "Resolved job resources");
        Ok(resolved)
    }

    fn resolve_processes(&self, rule: PopulationRule) -> Result<ResolvedResources, ResourceError> {
        let insufficient = || {
            ResourceError::InvalidResourceSpec(
                "At least two among `num_machines`, `num_mpiprocs_per_machine` or \
                 `tot_num_mpiprocs` must be specified."
                    .to_string(),
            )
        };

        let unset = [self.machines, self.procs_per_machine, self.total_procs]
            .iter()
            .filter(|value| value.is_none())
            .count();
        if unset > 1 {
            return Err(insufficient());
        }

        at_least_one(ResourceField::Machines, self.machines)?;
        at_least_one(ResourceField::ProcsPerMachine, self.procs_per_machine)?;

        let (machines, procs_per_machine, total_procs) =
            match (self.machines, self.procs_per_machine, self.total_procs) {
                (None, Some(per_machine), Some(total)) => {
                    (total.div_ceil(per_machine), per_machine, total)
                }
                (Some(machines), None, Some(total)) => {
                    if total % machines != 0 {
                        return Err(ResourceError::NotAMultiple {
                            total_procs: total,
                            machines,
                        });
                    }
                    (machines, total / machines, total)
                }
                (Some(machines), Some(per_machine), None) => {
                    (machines, per_machine, capacity(machines, per_machine)?)
                }
                (Some(machines), Some(per_machine), Some(total)) => (machines, per_machine, total),
                _ => return Err(insufficient()),
            };

        // A derived total fills the machines exactly and is never rejected.
        let capacity = capacity(machines, procs_per_machine)?;
        if self.total_procs.is_some() && rule.rejects(total_procs, capacity) {
            return Err(ResourceError::OverAllocated {
                total_procs,
                capacity,
            });
        }

        at_least_one(ResourceField::ProcsPerMachine, Some(procs_per_machine))?;
        at_least_one(ResourceField::Machines, Some(machines))?;
        at_least_one(ResourceField::TotalProcs, Some(total_procs))?;

        Ok(ResolvedResources {
            machines,
            procs_per_machine,
            total_procs,
            cores_per_proc: None,
            cores_per_machine: None,
        })
    }
}

/// Reads a YAML mapping of parameter names to integers or integer strings.
pub fn read_resource_params(path: &Path) -> Result<Vec<(String, ParamValue)>, NegotiateError> {
    let file = File::open(path).map_err(|source| NegotiateError::ResourceFile {
        path: path.to_path_buf(),
        source,
    })?;
    let params: HashMap<String, RawParam> =
        serde_yaml::from_reader(file).map_err(|source| NegotiateError::ResourceYaml {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(params.into_iter().map(|(k, RawParam(v))| (k, v)).collect())
}

pub fn load_resource_file(path: &Path) -> Result<ResourceSpec, NegotiateError> {
    let spec = ResourceSpec::from_params(read_resource_params(path)?)?;
    Ok(spec)
}

/// A fully determined resource request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedResources {
    pub machines: u64,
    pub procs_per_machine: u64,
    pub total_procs: u64,
    /// Unset when the request carried no core information.
    pub cores_per_proc: Option<u64>,
    /// Unset unless requested explicitly.
    pub cores_per_machine: Option<u64>,
}

impl ResolvedResources {
    /// Number of process slots on all machines together.
    pub fn capacity(&self) -> u64 {
        self.procs_per_machine * self.machines
    }

    pub fn is_underpopulated(&self) -> bool {
        self.total_procs < self.capacity()
    }

    fn with_cores(
        mut self,
        cores_per_proc: Option<u64>,
        cores_per_machine: Option<u64>,
    ) -> Result<Self, ResourceError> {
        at_least_one(ResourceField::CoresPerProc, cores_per_proc)?;

        match (cores_per_proc, cores_per_machine) {
            (Some(per_proc), Some(per_machine)) => {
                if per_proc.checked_mul(self.procs_per_machine) != Some(per_machine) {
                    return Err(ResourceError::CoreMismatch {
                        cores_per_machine: per_machine,
                        procs_per_machine: self.procs_per_machine,
                    });
                }
            }
            (None, Some(per_machine)) => {
                at_least_one(ResourceField::CoresPerMachine, Some(per_machine))?;
                if per_machine % self.procs_per_machine != 0 {
                    return Err(ResourceError::CoreMismatch {
                        cores_per_machine: per_machine,
                        procs_per_machine: self.procs_per_machine,
                    });
                }
                self.cores_per_proc = Some(per_machine / self.procs_per_machine);
            }
            (Some(_), None) | (None, None) => {}
        }
        if cores_per_proc.is_some() {
            self.cores_per_proc = cores_per_proc;
        }
        self.cores_per_machine = cores_per_machine;
        Ok(self)
    }
}

impl fmt::Display for ResolvedResources {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} machine(s) x {} process(es), {} process(es) in total",
            self.machines, self.procs_per_machine, self.total_procs
        )?;
        if let Some(per_proc) = self.cores_per_proc {
            write!(f, ", {} core(s) per process", per_proc)?;
        }
        if let Some(per_machine) = self.cores_per_machine {
            write!(f, ", {} core(s) per machine", per_machine)?;
        }
        Ok(())
    }
}

fn at_least_one(field: ResourceField, value: Option<u64>) -> Result<(), ResourceError> {
    match value {
        Some(value) if value < 1 => Err(ResourceError::InvalidResourceSpec(format!(
            "`{}` must be greater than or equal to one.",
            field
        ))),
        _ => Ok(()),
    }
}

fn capacity(machines: u64, procs_per_machine: u64) -> Result<u64, ResourceError> {
    procs_per_machine.checked_mul(machines).ok_or_else(|| {
        ResourceError::InvalidResourceSpec(
            "`num_mpiprocs_per_machine * num_machines` is out of range.".to_string(),
        )
    })
}

fn to_count(field: ResourceField, value: &ParamValue) -> Result<u64, ResourceError> {
    let invalid = || {
        ResourceError::InvalidResourceSpec(format!(
            "`{}` must be a non-negative integer when specified, got {}.",
            field, value
        ))
    };
    match value {
        ParamValue::Integer(value) => u64::try_from(*value).map_err(|_| invalid()),
        ParamValue::Text(text) => text.trim().parse::<u64>().map_err(|_| invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(params: &[(&str, i64)]) -> Result<ResourceSpec, ResourceError> {
        ResourceSpec::from_params(params.iter().map(|(k, v)| (*k, ParamValue::from(*v))))
    }

    fn resolve(params: &[(&str, i64)]) -> Result<ResolvedResources, ResourceError> {
        spec(params)?.resolve()
    }

    fn assert_invalid(result: Result<ResolvedResources, ResourceError>) {
        assert!(
            matches!(result, Err(ResourceError::InvalidResourceSpec(_))),
            "expected InvalidResourceSpec, got {:?}",
            result
        );
    }

    #[test]
    fn test_requires_two_of_three_process_fields() {
        assert_invalid(resolve(&[]));
        assert_invalid(resolve(&[("num_machines", 1)]));
        assert_invalid(resolve(&[("num_mpiprocs_per_machine", 1)]));
        assert_invalid(resolve(&[("tot_num_mpiprocs", 1)]));
        // Cores alone do not count.
        assert_invalid(resolve(&[("machines", 1), ("cores_per_proc", 4)]));
    }

    #[test]
    fn test_unknown_parameter_wins_over_valid_fields() {
        let err = resolve(&[
            ("num_machines", 2),
            ("num_mpiprocs_per_machine", 8),
            ("wrong_name", 16),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ResourceError::UnknownParameter(vec!["wrong_name".to_string()])
        );
    }

    #[test]
    fn test_unknown_parameters_are_sorted_and_deduplicated() {
        let err = resolve(&[("zeta", 1), ("alpha", 2), ("zeta", 3)]).unwrap_err();
        assert_eq!(
            err,
            ResourceError::UnknownParameter(vec!["alpha".to_string(), "zeta".to_string()])
        );
    }

    #[test]
    fn test_unknown_parameter_reported_before_bad_value() {
        let err = ResourceSpec::from_params(vec![
            ("machines", ParamValue::from("many")),
            ("bogus", ParamValue::from(1)),
        ])
        .unwrap_err();
        assert!(matches!(err, ResourceError::UnknownParameter(_)));
    }

    #[test]
    fn test_zero_machines_or_procs_rejected() {
        assert_invalid(resolve(&[("num_machines", 0), ("num_mpiprocs_per_machine", 8)]));
        assert_invalid(resolve(&[("num_machines", 1), ("num_mpiprocs_per_machine", 0)]));
    }

    #[test]
    fn test_zero_total_rejected() {
        assert!(resolve(&[("num_machines", 1), ("tot_num_mpiprocs", 0)]).is_err());
        assert!(resolve(&[("num_mpiprocs_per_machine", 1), ("tot_num_mpiprocs", 0)]).is_err());
        assert_invalid(resolve(&[
            ("num_machines", 2),
            ("num_mpiprocs_per_machine", 8),
            ("tot_num_mpiprocs", 0),
        ]));
    }

    #[test]
    fn test_total_derived_from_machines_and_procs() {
        for machines in 1..=4 {
            for per_machine in 1..=16 {
                let res = resolve(&[("machines", machines), ("procs_per_machine", per_machine)])
                    .unwrap();
                assert_eq!(res.total_procs, (machines * per_machine) as u64);
                assert!(!res.is_underpopulated());
            }
        }
    }

    #[test]
    fn test_machines_rounded_up() {
        let res = resolve(&[("num_mpiprocs_per_machine", 8), ("tot_num_mpiprocs", 15)]).unwrap();
        assert_eq!(res.machines, 2);
        assert_eq!(res.total_procs, 15);
        assert!(res.is_underpopulated());
    }

    #[test]
    fn test_too_few_machines_rejected() {
        let err = resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("tot_num_mpiprocs", 15),
            ("num_machines", 1),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ResourceError::OverAllocated {
                total_procs: 15,
                capacity: 8
            }
        );
    }

    #[test]
    fn test_over_allocation_rejected() {
        let err = resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("num_machines", 2),
            ("tot_num_mpiprocs", 32),
        ])
        .unwrap_err();
        assert!(matches!(err, ResourceError::OverAllocated { .. }));
    }

    #[test]
    fn test_exact_full_population_boundary() {
        let full = spec(&[
            ("num_mpiprocs_per_machine", 8),
            ("num_machines", 2),
            ("tot_num_mpiprocs", 16),
        ])
        .unwrap();
        assert_eq!(
            full.resolve().unwrap_err(),
            ResourceError::OverAllocated {
                total_procs: 16,
                capacity: 16
            }
        );
        let res = full.resolve_with(PopulationRule::AllowFull).unwrap();
        assert_eq!(res.total_procs, 16);

        let over = spec(&[
            ("num_mpiprocs_per_machine", 8),
            ("num_machines", 2),
            ("tot_num_mpiprocs", 17),
        ])
        .unwrap();
        assert!(over.resolve_with(PopulationRule::AllowFull).is_err());
    }

    #[test]
    fn test_procs_per_machine_derived_from_multiple() {
        let spec = spec(&[("num_machines", 2), ("tot_num_mpiprocs", 16)]).unwrap();
        // The derived layout fills the machines exactly.
        assert!(matches!(
            spec.resolve(),
            Err(ResourceError::OverAllocated { .. })
        ));
        let res = spec.resolve_with(PopulationRule::AllowFull).unwrap();
        assert_eq!(res.procs_per_machine, 8);
    }

    #[test]
    fn test_not_a_multiple() {
        let err = resolve(&[("num_machines", 3), ("tot_num_mpiprocs", 16)]).unwrap_err();
        assert_eq!(
            err,
            ResourceError::NotAMultiple {
                total_procs: 16,
                machines: 3
            }
        );
    }

    #[test]
    fn test_underpopulation_with_cores_per_proc() {
        let res = resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("num_machines", 2),
            ("tot_num_mpiprocs", 8),
            ("num_cores_per_mpiproc", 2),
        ])
        .unwrap();
        assert_eq!(res.cores_per_proc, Some(2));
        assert_eq!(res.cores_per_machine, None);
    }

    #[test]
    fn test_cores_per_proc_derived_from_cores_per_machine() {
        let res = resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("num_machines", 2),
            ("tot_num_mpiprocs", 8),
            ("num_cores_per_machine", 16),
        ])
        .unwrap();
        assert_eq!(res.cores_per_proc, Some(2));
        assert_eq!(res.cores_per_machine, Some(16));
    }

    #[test]
    fn test_consistent_cores() {
        let res = resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("tot_num_mpiprocs", 15),
            ("num_machines", 2),
            ("num_cores_per_mpiproc", 2),
            ("num_cores_per_machine", 16),
        ])
        .unwrap();
        assert_eq!(res.cores_per_proc, Some(2));
    }

    #[test]
    fn test_core_mismatch() {
        let err = resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("tot_num_mpiprocs", 15),
            ("num_cores_per_mpiproc", 2),
            ("num_cores_per_machine", 12),
        ])
        .unwrap_err();
        assert!(matches!(err, ResourceError::CoreMismatch { .. }));

        let err = resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("tot_num_mpiprocs", 15),
            ("num_cores_per_machine", 12),
        ])
        .unwrap_err();
        assert!(matches!(err, ResourceError::CoreMismatch { .. }));
    }

    #[test]
    fn test_zero_cores_rejected() {
        assert_invalid(resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("tot_num_mpiprocs", 15),
            ("num_cores_per_machine", 0),
        ]));
        assert_invalid(resolve(&[
            ("num_mpiprocs_per_machine", 8),
            ("tot_num_mpiprocs", 15),
            ("num_cores_per_mpiproc", 0),
        ]));
    }

    #[test]
    fn test_string_values_are_converted() {
        let spec = ResourceSpec::from_params(vec![
            ("num_machines", ParamValue::from(" 2 ")),
            ("procs_per_machine", ParamValue::from("8")),
        ])
        .unwrap();
        assert_eq!(spec.machines, Some(2));
        assert_eq!(spec.resolve().unwrap().total_procs, 16);
    }

    #[test]
    fn test_bad_values_rejected() {
        let err = ResourceSpec::from_params(vec![("machines", ParamValue::from("two"))]);
        assert!(matches!(err, Err(ResourceError::InvalidResourceSpec(_))));
        let err = ResourceSpec::from_params(vec![("machines", ParamValue::from(-1))]);
        assert!(matches!(err, Err(ResourceError::InvalidResourceSpec(_))));
    }

    #[test]
    fn test_alias_given_twice_rejected() {
        let err = spec(&[("machines", 2), ("num_machines", 2), ("procs_per_machine", 1)]);
        assert!(matches!(err, Err(ResourceError::InvalidResourceSpec(_))));
    }

    #[test]
    fn test_overflow_rejected() {
        let spec = ResourceSpec {
            machines: Some(u64::MAX),
            procs_per_machine: Some(2),
            ..Default::default()
        };
        assert_invalid(spec.resolve());
    }
}
