use log::debug;

/// Parameter names as they appear on the wire schema and in JSON documents
pub mod names {
    pub const CURRENT_A: &str = "currentA";
    pub const VOLTAGE_V: &str = "voltageV";
    pub const CUTOFF_A: &str = "cutoffA";
    pub const CUTOFF_V: &str = "cutoffV";
    pub const POWER_W: &str = "powerW";
    pub const MAX_TIME_M: &str = "maxTimeM";
    pub const CAPACITY_AH: &str = "capacityAh";
    pub const CURRENT_SET_A: &str = "currentSetA";
    pub const VOLTAGE_SET_V: &str = "voltageSetV";
    pub const POWER_SET_W: &str = "powerSetW";
    pub const MAX_TIME_SET_M: &str = "maxTimeSetM";
}

/// Physical-unit encoding rule of one 16-bit wire slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackingKind {
    /// Slot without a known meaning
    None,
    /// Measured voltage (V)
    Voltage,
    /// Voltage setpoint (V)
    VoltageSet,
    /// Measured current (A)
    Current,
    /// Current setpoint (A)
    CurrentSet,
    /// Power (W), raw integer
    Power,
    /// Time (minutes), raw integer
    Time,
    /// Accumulated capacity (Ah)
    Capacity,
}

/// Declared meaning of one wire slot, part of a device schema
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterShape {
    pub index: usize,
    pub name: &'static str,
    pub packing: PackingKind,
    pub mandatory: bool,
}

impl ParameterShape {
    pub const fn required(index: usize, name: &'static str, packing: PackingKind) -> Self {
        Self {
            index,
            name,
            packing,
            mandatory: true,
        }
    }

    pub const fn optional(index: usize, name: &'static str, packing: PackingKind) -> Self {
        Self {
            index,
            name,
            packing,
            mandatory: false,
        }
    }
}

/// One wire slot together with its raw and physical value
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Position of the slot in the frame
    pub index: usize,
    /// Name used in JSON documents
    pub name: &'static str,
    pub packing: PackingKind,
    /// Value bit for bit as found on the wire
    pub raw: u16,
    /// Physical value
    pub value: f64,
    /// Whether a command needs this parameter
    pub mandatory: bool,
}

impl Parameter {
    pub fn new(index: usize, name: &'static str, packing: PackingKind, value: f64) -> Self {
        Self {
            index,
            name,
            packing,
            raw: 0,
            value,
            mandatory: true,
        }
    }
}

impl From<&ParameterShape> for Parameter {
    fn from(shape: &ParameterShape) -> Self {
        Self {
            index: shape.index,
            name: shape.name,
            packing: shape.packing,
            raw: 0,
            value: 0.0,
            mandatory: shape.mandatory,
        }
    }
}

/// Latest and previous decoded parameter snapshot
#[derive(Debug, Default)]
pub struct ParameterStore {
    latest: Vec<Parameter>,
    previous: Vec<Parameter>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `parameters` the latest snapshot, keeping the old one for comparison
    pub fn push(&mut self, parameters: Vec<Parameter>) {
        self.previous = std::mem::replace(&mut self.latest, parameters);
    }

    /// Compare the raw wire value of `name` between the two snapshots.
    ///
    /// A parameter missing from the previous snapshot counts as changed, one
    /// missing from the latest snapshot as unchanged.
    pub fn has_changed(&self, name: &str) -> bool {
        let Some(latest) = self.latest.iter().find(|p| p.name == name) else {
            debug!("parameter {} not found in store", name);
            return false;
        };
        match self.previous.iter().find(|p| p.name == name) {
            Some(previous) => previous.raw != latest.raw,
            None => {
                debug!("parameter {} not found in last store", name);
                true
            }
        }
    }

    /// Physical value of `name` in the latest snapshot, 0.0 if absent
    pub fn value(&self, name: &str) -> f64 {
        self.latest
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
            .unwrap_or(0.0)
    }

    pub fn clear(&mut self) {
        self.latest.clear();
        self.previous.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voltage(raw: u16, value: f64) -> Parameter {
        Parameter {
            raw,
            ..Parameter::new(1, names::VOLTAGE_V, PackingKind::Voltage, value)
        }
    }

    #[test]
    fn test_store_first_push_counts_as_changed() {
        let mut store = ParameterStore::new();
        store.push(vec![voltage(0x0F96, 3.99)]);
        assert!(store.has_changed(names::VOLTAGE_V));
        assert_eq!(store.value(names::VOLTAGE_V), 3.99);
    }

    #[test]
    fn test_store_compares_raw_values() {
        let mut store = ParameterStore::new();
        store.push(vec![voltage(0x0F96, 3.99)]);
        store.push(vec![voltage(0x0F96, 3.99)]);
        assert!(!store.has_changed(names::VOLTAGE_V));

        store.push(vec![voltage(0x0F97, 3.991)]);
        assert!(store.has_changed(names::VOLTAGE_V));
    }

    #[test]
    fn test_store_missing_parameter() {
        let mut store = ParameterStore::new();
        store.push(vec![voltage(0x0F96, 3.99)]);
        assert!(!store.has_changed(names::CAPACITY_AH));
        assert_eq!(store.value(names::CAPACITY_AH), 0.0);

        store.clear();
        assert_eq!(store.value(names::VOLTAGE_V), 0.0);
    }
}
