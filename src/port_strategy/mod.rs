//! Provides a means to turn a port specification into the order ports are scanned in.
use crate::input::{PortSpec, ScanOrder, LOWEST_PORT_NUMBER, TOP_PORT_NUMBER};
use rand::rng;
use rand::seq::SliceRandom;

/// Represents options of port scanning.
///
/// An explicit list is kept as given (or shuffled); "all ports" is kept as a
/// range and only materialised when the order is generated.
#[derive(Debug, Clone)]
pub enum PortStrategy {
    Manual(Vec<u16>),
    Serial(SerialRange),
    Random(RandomRange),
}

impl PortStrategy {
    pub fn pick(spec: &PortSpec, order: ScanOrder) -> Self {
        match (spec, order) {
            (PortSpec::All, ScanOrder::Serial) => Self::Serial(SerialRange::full()),
            (PortSpec::All, ScanOrder::Random) => Self::Random(RandomRange::full()),
            (PortSpec::Explicit(ports), ScanOrder::Serial) => Self::Manual(ports.clone()),
            (PortSpec::Explicit(ports), ScanOrder::Random) => {
                let mut ports = ports.clone();
                ports.shuffle(&mut rng());
                Self::Manual(ports)
            }
        }
    }

    pub fn order(&self) -> Vec<u16> {
        match self {
            Self::Manual(ports) => ports.clone(),
            Self::Serial(range) => range.generate(),
            Self::Random(range) => range.generate(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Manual(ports) => ports.len(),
            Self::Serial(SerialRange { start, end }) | Self::Random(RandomRange { start, end }) => {
                usize::from(*end - *start) + 1
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait associated with a port strategy. Each PortStrategy must be able
/// to generate an order for future port scanning.
trait RangeOrder {
    fn generate(&self) -> Vec<u16>;
}

/// As the name implies SerialRange will always generate a vector in
/// ascending order.
#[derive(Debug, Clone)]
pub struct SerialRange {
    start: u16,
    end: u16,
}

impl SerialRange {
    const fn full() -> Self {
        Self {
            start: LOWEST_PORT_NUMBER,
            end: TOP_PORT_NUMBER,
        }
    }
}

impl RangeOrder for SerialRange {
    fn generate(&self) -> Vec<u16> {
        (self.start..=self.end).collect()
    }
}

/// As the name implies RandomRange will always generate a vector with
/// a random order.
#[derive(Debug, Clone)]
pub struct RandomRange {
    start: u16,
    end: u16,
}

impl RandomRange {
    const fn full() -> Self {
        Self {
            start: LOWEST_PORT_NUMBER,
            end: TOP_PORT_NUMBER,
        }
    }
}

impl RangeOrder for RandomRange {
    fn generate(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = (self.start..=self.end).collect();
        ports.shuffle(&mut rng());
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::PortStrategy;
    use crate::input::{PortSpec, ScanOrder};

    #[test]
    fn serial_strategy_covers_every_port() {
        let strategy = PortStrategy::pick(&PortSpec::All, ScanOrder::Serial);
        let result = strategy.order();

        assert_eq!(result.len(), 65535);
        assert_eq!(strategy.len(), 65535);
        assert_eq!(result.first(), Some(&1));
        assert_eq!(result.last(), Some(&65535));
    }

    #[test]
    fn random_strategy_covers_every_port() {
        let strategy = PortStrategy::pick(&PortSpec::All, ScanOrder::Random);
        let mut result = strategy.order();
        result.sort_unstable();

        assert_eq!(result, (1..=65535).collect::<Vec<u16>>());
    }

    #[test]
    fn serial_strategy_with_ports() {
        let strategy = PortStrategy::pick(&PortSpec::Explicit(vec![80, 443, 6379]), ScanOrder::Serial);
        assert_eq!(strategy.order(), vec![80, 443, 6379]);
    }

    #[test]
    fn random_strategy_with_ports() {
        let ports = (1..=100).collect::<Vec<u16>>();
        let strategy = PortStrategy::pick(&PortSpec::Explicit(ports.clone()), ScanOrder::Random);
        let mut result = strategy.order();
        result.sort_unstable();

        assert_eq!(result, ports);
    }
}
