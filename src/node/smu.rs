//! Source-measure unit addressing.
//!
//! An SMU is addressed as `_G.smua` on the node the session talks to and as
//! `_G.node[n].smua` anywhere else. [`SmuAddress`] keeps the derived name and
//! reference in step with the node and unit numbers; every setter recomputes
//! both. A [`SourceMeasureUnit`] pushes address changes down to the
//! subsystems it owns.

use crate::error::{TspError, TspResult};
use std::fmt;
use std::str::FromStr;

/// SMU channel letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmuUnit {
    /// Channel `a`.
    A,
    /// Channel `b`.
    B,
}

impl fmt::Display for SmuUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "a",
            Self::B => "b",
        })
    }
}

impl FromStr for SmuUnit {
    type Err = TspError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            other => Err(TspError::InvalidArgument(format!("unknown SMU unit '{other}'"))),
        }
    }
}

/// Node and unit numbers of an SMU with the derived name and reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmuAddress {
    node_number: i32,
    local_node_number: i32,
    unit: Option<SmuUnit>,
    name: String,
    reference: String,
}

impl SmuAddress {
    /// Address of `unit` on `node_number`, seen from `local_node_number`.
    pub fn new(node_number: i32, local_node_number: i32, unit: Option<SmuUnit>) -> Self {
        let mut address = Self {
            node_number,
            local_node_number,
            unit,
            ..Self::default()
        };
        address.recompute();
        address
    }

    fn recompute(&mut self) {
        let Some(unit) = self.unit else {
            self.name.clear();
            self.reference.clear();
            return;
        };
        self.name = format!("smu{unit}");
        self.reference = if self.is_local() {
            format!("_G.{}", self.name)
        } else {
            format!("_G.node[{}].{}", self.node_number, self.name)
        };
    }

    /// True when the SMU is on the node the session talks to.
    pub fn is_local(&self) -> bool {
        self.node_number <= 0 || self.node_number == self.local_node_number
    }

    /// Node number; zero or negative means local.
    pub fn node_number(&self) -> i32 {
        self.node_number
    }

    /// Node the session talks to; zero when unknown.
    pub fn local_node_number(&self) -> i32 {
        self.local_node_number
    }

    /// Unit letter, if set.
    pub fn unit(&self) -> Option<SmuUnit> {
        self.unit
    }

    /// `smua` or `smub`; empty until the unit is set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified reference; empty until the unit is set.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Sets the node number.
    pub fn set_node_number(&mut self, node_number: i32) {
        self.node_number = node_number;
        self.recompute();
    }

    /// Sets the local node number.
    pub fn set_local_node_number(&mut self, local_node_number: i32) {
        self.local_node_number = local_node_number;
        self.recompute();
    }

    /// Sets the unit.
    pub fn set_unit(&mut self, unit: Option<SmuUnit>) {
        self.unit = unit;
        self.recompute();
    }
}

/// A subsystem of an SMU, such as `source` or `measure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmuSubsystem {
    kind: String,
    address: SmuAddress,
}

impl SmuSubsystem {
    /// Subsystem table `kind` of an SMU whose address is set on insertion.
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            address: SmuAddress::default(),
        }
    }

    /// Subsystem table name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Address of the owning SMU.
    pub fn address(&self) -> &SmuAddress {
        &self.address
    }

    /// `<smu reference>.<kind>`.
    pub fn reference(&self) -> String {
        format!("{}.{}", self.address.reference(), self.kind)
    }

    /// Key used for lookups.
    pub fn unique_key(&self) -> String {
        self.reference()
    }
}

/// Subsystems owned by one SMU, all sharing its address.
#[derive(Debug, Clone, Default)]
pub struct SourceMeasureUnitSubsystemCollection {
    address: SmuAddress,
    items: Vec<SmuSubsystem>,
}

impl SourceMeasureUnitSubsystemCollection {
    /// Collection for SMUs at `address`.
    pub fn new(address: SmuAddress) -> Self {
        Self {
            address,
            items: Vec::new(),
        }
    }

    /// Adds a subsystem, forcing its address to the collection's.
    ///
    /// Fails with [`TspError::InvalidState`] before the unit is set, or when
    /// a subsystem with the same reference is already present.
    pub fn add(&mut self, mut item: SmuSubsystem) -> TspResult<()> {
        if self.address.unit().is_none() {
            return Err(TspError::InvalidState(format!(
                "cannot add '{}' before the SMU unit is set",
                item.kind
            )));
        }
        item.address = self.address.clone();
        if self.contains_key(&item.unique_key()) {
            return Err(TspError::InvalidState(format!(
                "'{}' is already in the collection",
                item.unique_key()
            )));
        }
        self.items.push(item);
        Ok(())
    }

    /// Looks a subsystem up by reference.
    pub fn get(&self, key: &str) -> Option<&SmuSubsystem> {
        self.items.iter().find(|i| i.unique_key() == key)
    }

    /// True when a subsystem has this reference.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Owned subsystems.
    pub fn iter(&self) -> impl Iterator<Item = &SmuSubsystem> {
        self.items.iter()
    }

    /// Number of subsystems.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Shared address.
    pub fn address(&self) -> &SmuAddress {
        &self.address
    }

    fn set_address(&mut self, address: &SmuAddress) {
        self.address = address.clone();
        for item in &mut self.items {
            item.address = address.clone();
        }
    }
}

/// An SMU and the subsystems addressed through it.
#[derive(Debug, Clone, Default)]
pub struct SourceMeasureUnit {
    address: SmuAddress,
    subsystems: SourceMeasureUnitSubsystemCollection,
}

impl SourceMeasureUnit {
    /// SMU `unit` on `node_number`.
    pub fn new(node_number: i32, local_node_number: i32, unit: Option<SmuUnit>) -> Self {
        let address = SmuAddress::new(node_number, local_node_number, unit);
        Self {
            subsystems: SourceMeasureUnitSubsystemCollection::new(address.clone()),
            address,
        }
    }

    /// Current address.
    pub fn address(&self) -> &SmuAddress {
        &self.address
    }

    /// `smua` or `smub`.
    pub fn name(&self) -> &str {
        self.address.name()
    }

    /// Fully qualified reference.
    pub fn reference(&self) -> &str {
        self.address.reference()
    }

    /// Two SMUs with the same reference are the same entity.
    pub fn unique_key(&self) -> &str {
        self.address.reference()
    }

    /// Owned subsystems.
    pub fn subsystems(&self) -> &SourceMeasureUnitSubsystemCollection {
        &self.subsystems
    }

    /// Adds an owned subsystem.
    pub fn add_subsystem(&mut self, item: SmuSubsystem) -> TspResult<()> {
        self.subsystems.add(item)
    }

    /// Moves the SMU, and every owned subsystem, to `node_number`.
    pub fn set_node_number(&mut self, node_number: i32) {
        self.address.set_node_number(node_number);
        self.subsystems.set_address(&self.address);
    }

    /// Sets the node the session talks to.
    pub fn set_local_node_number(&mut self, local_node_number: i32) {
        self.address.set_local_node_number(local_node_number);
        self.subsystems.set_address(&self.address);
    }

    /// Changes the unit of the SMU and every owned subsystem.
    pub fn set_unit(&mut self, unit: Option<SmuUnit>) {
        self.address.set_unit(unit);
        self.subsystems.set_address(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_reference() {
        let smu = SourceMeasureUnit::new(2, 1, Some(SmuUnit::B));
        assert_eq!(smu.name(), "smub");
        assert_eq!(smu.reference(), "_G.node[2].smub");
    }

    #[test]
    fn test_local_reference() {
        for node in [0, -1] {
            let smu = SourceMeasureUnit::new(node, 1, Some(SmuUnit::A));
            assert_eq!(smu.reference(), "_G.smua");
            assert!(!smu.reference().contains("node["));
        }
        let own = SourceMeasureUnit::new(1, 1, Some(SmuUnit::A));
        assert_eq!(own.reference(), "_G.smua");
    }

    #[test]
    fn test_setters_recompute_reference() {
        let mut smu = SourceMeasureUnit::new(0, 1, None);
        assert_eq!(smu.reference(), "");
        smu.set_unit(Some(SmuUnit::A));
        assert_eq!(smu.reference(), "_G.smua");
        smu.set_node_number(3);
        assert_eq!(smu.reference(), "_G.node[3].smua");
        smu.set_local_node_number(3);
        assert_eq!(smu.reference(), "_G.smua");
    }

    #[test]
    fn test_add_before_unit_fails() {
        let mut smu = SourceMeasureUnit::new(2, 1, None);
        let err = smu.add_subsystem(SmuSubsystem::new("source")).unwrap_err();
        assert!(matches!(err, TspError::InvalidState(_)));
    }

    #[test]
    fn test_changes_propagate_to_subsystems() {
        let mut smu = SourceMeasureUnit::new(2, 1, Some(SmuUnit::A));
        smu.add_subsystem(SmuSubsystem::new("source")).unwrap();
        smu.add_subsystem(SmuSubsystem::new("measure")).unwrap();
        assert!(smu.subsystems().contains_key("_G.node[2].smua.source"));

        smu.set_node_number(4);
        smu.set_unit(Some(SmuUnit::B));
        let refs: Vec<String> = smu.subsystems().iter().map(SmuSubsystem::reference).collect();
        assert_eq!(refs, vec!["_G.node[4].smub.source", "_G.node[4].smub.measure"]);
        assert!(smu.subsystems().iter().all(|s| s.address() == smu.address()));
    }

    #[test]
    fn test_duplicate_reference_rejected() {
        let mut smu = SourceMeasureUnit::new(2, 1, Some(SmuUnit::A));
        smu.add_subsystem(SmuSubsystem::new("source")).unwrap();
        assert!(smu.add_subsystem(SmuSubsystem::new("source")).is_err());
        assert_eq!(smu.subsystems().len(), 1);
    }

    #[test]
    fn test_unit_parse() {
        assert_eq!("B".parse::<SmuUnit>().unwrap(), SmuUnit::B);
        assert!("c".parse::<SmuUnit>().is_err());
    }
}
