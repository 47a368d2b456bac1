//! Test data builders for creating test objects

use tekscope_rs::backend::codec::DUMP_PAYLOAD_LEN;
use tekscope_rs::backend::ViolationPolicyKind;
use tekscope_rs::config::ServiceConfig;
use tekscope_rs::types::SAMPLES_PER_CAPTURE;

/// Builder for scope memory images
///
/// Records are laid out the way the scope writes them: the record after the
/// end address is the oldest one.
pub struct MemoryBuilder {
    end_address: u16,
    memory: Vec<u8>,
}

impl MemoryBuilder {
    pub fn new(end_address: u16) -> Self {
        Self {
            end_address,
            memory: vec![0; DUMP_PAYLOAD_LEN],
        }
    }

    /// Set the codes of the `n`-th oldest record
    pub fn record(mut self, n: usize, code_a: u16, code_b: u16) -> Self {
        let start = (self.end_address as usize + 4 + 4 * n) % DUMP_PAYLOAD_LEN;
        let bytes = [code_a.to_be_bytes(), code_b.to_be_bytes()].concat();
        for (offset, byte) in bytes.into_iter().enumerate() {
            self.memory[(start + offset) % DUMP_PAYLOAD_LEN] = byte;
        }
        self
    }

    /// Fill every record with codes derived from its age
    pub fn ramp(mut self) -> Self {
        for n in 0..SAMPLES_PER_CAPTURE {
            self = self.record(n, n as u16, 1023 - n as u16);
        }
        self
    }

    pub fn end_address(&self) -> u16 {
        self.end_address
    }

    pub fn build(self) -> Vec<u8> {
        self.memory
    }
}

/// Builder for service configs with test-friendly timeouts
pub struct ConfigBuilder {
    config: ServiceConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = ServiceConfig::default();
        config.scope.read_timeout_ms = 20;
        config.panel.read_timeout_ms = 20;
        config.acquisition.max_consecutive_timeouts = 3;
        Self { config }
    }

    pub fn policy(mut self, policy: ViolationPolicyKind, limit: Option<usize>) -> Self {
        self.config.acquisition.violation_policy = policy;
        self.config.acquisition.resync_limit = limit;
        self
    }

    pub fn sample_rate_divisor(mut self, divisor: u8) -> Self {
        self.config.capture.sample_rate_divisor = divisor;
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_builder_wraps_records() {
        let memory = MemoryBuilder::new(4092).record(0, 0x3FF, 0x001).build();
        // Oldest record after 4092 starts at 0
        assert_eq!(&memory[..4], &[0x03, 0xFF, 0x00, 0x01]);
    }
}
