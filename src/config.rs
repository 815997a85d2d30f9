//! Configuration model
//!
//! The gateway is configured from one YAML/TOML/JSON file (plus
//! `SERIALSRV_`-prefixed environment overrides): a list of ports, each with
//! a transport and its devices, each device with timings, setup writes and
//! registers. Validation is fail-fast at load time so poll time never sees a
//! malformed definition.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::core::device::{Device, DeviceTimings, SetupItem};
use crate::core::protocols::CodecRegistry;
use crate::core::register::{
    Register, RegisterBank, RegisterFormat, RegisterKey, SporadicMode, WordOrder,
};
use crate::core::transport::{
    LineSettings, SerialPortConfig, SerialTransport, TcpPortConfig, TcpTransport, Transport,
};
use crate::error::{ErrorExt, GatewayError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub ports: Vec<PortConfig>,
}

/// One physical channel and the devices on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    pub devices: Vec<DeviceConfig>,
}

/// Transport selection, tagged by the `transport` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial(SerialPortConfig),
    Tcp(TcpPortConfig),
}

/// One device on a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub slave_id: u8,
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub request_delay_ms: u64,
    #[serde(default)]
    pub inter_device_delay_ms: u64,
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,
    #[serde(default = "default_max_fail_cycles")]
    pub max_fail_cycles: u32,
    #[serde(default = "default_max_register_hole")]
    pub max_register_hole: u32,
    #[serde(default = "default_max_read_registers")]
    pub max_read_registers: usize,
    #[serde(default = "default_events_poll_interval_ms")]
    pub events_poll_interval_ms: u64,
    /// Per-device serial line override applied for this device's
    /// transactions only.
    #[serde(default)]
    pub line: Option<LineSettings>,
    #[serde(default)]
    pub setup: Vec<SetupConfig>,
    pub registers: Vec<RegisterConfig>,
}

/// A write applied at device (re)connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    pub name: String,
    #[serde(default = "default_reg_type")]
    pub reg_type: String,
    pub address: u32,
    pub value: u64,
    #[serde(default = "default_format")]
    pub format: RegisterFormat,
}

/// One register definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub name: String,
    #[serde(default = "default_reg_type")]
    pub reg_type: String,
    pub address: u32,
    #[serde(default = "default_format")]
    pub format: RegisterFormat,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Poll period in milliseconds; absent means best-effort polling.
    #[serde(default)]
    pub read_period_ms: Option<u64>,
    #[serde(default)]
    pub sporadic: SporadicMode,
    #[serde(default = "default_true")]
    pub poll: bool,
    #[serde(default)]
    pub bit_offset: u8,
    /// Defaults to the full format width.
    #[serde(default)]
    pub bit_width: Option<u8>,
}

fn default_protocol() -> String {
    "modbus_rtu".to_string()
}

fn default_reg_type() -> String {
    "holding".to_string()
}

fn default_format() -> RegisterFormat {
    RegisterFormat::U16
}

fn default_scale() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_frame_timeout_ms() -> u64 {
    20
}

fn default_response_timeout_ms() -> u64 {
    500
}

fn default_device_timeout_ms() -> u64 {
    3000
}

fn default_max_fail_cycles() -> u32 {
    2
}

fn default_max_register_hole() -> u32 {
    1
}

fn default_max_read_registers() -> usize {
    125
}

fn default_events_poll_interval_ms() -> u64 {
    50
}

impl GatewayConfig {
    /// Load from a file chosen by extension, with `SERIALSRV_` environment
    /// overrides merged on top, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let figment = match ext {
            "yaml" | "yml" => Figment::from(Yaml::file(path)),
            "toml" => Figment::from(Toml::file(path)),
            "json" => Figment::from(Json::file(path)),
            other => {
                return Err(GatewayError::config(format!(
                    "unsupported config extension {other:?} for {}",
                    path.display()
                )))
            }
        };
        let config: Self = figment
            .merge(Env::prefixed("SERIALSRV_").split("__"))
            .extract()
            .config_error("failed to load configuration")?;
        config.validate()?;
        config.dry_build()?;
        Ok(config)
    }

    /// Resolve every transport and device against the built-in codecs
    /// without starting anything, so protocol-bound limits (addressing,
    /// read caps) are enforced at load time rather than at poll time.
    pub fn dry_build(&self) -> Result<()> {
        let registry = CodecRegistry::with_builtin();
        let bank = RegisterBank::new();
        for port in &self.ports {
            port.build_transport()?;
            port.build_devices(&registry, &bank)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(GatewayError::config("no ports configured"));
        }
        let mut port_names = std::collections::HashSet::new();
        for port in &self.ports {
            if !port_names.insert(port.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "duplicate port name {:?}",
                    port.name
                )));
            }
            port.validate()?;
        }
        Ok(())
    }
}

impl PortConfig {
    pub fn validate(&self) -> Result<()> {
        match &self.transport {
            TransportConfig::Serial(c) => c
                .validate()
                .map_err(|e| GatewayError::config(format!("port {}: {e}", self.name)))?,
            TransportConfig::Tcp(c) => c
                .validate()
                .map_err(|e| GatewayError::config(format!("port {}: {e}", self.name)))?,
        }
        if self.devices.is_empty() {
            return Err(GatewayError::config(format!(
                "port {}: no devices configured",
                self.name
            )));
        }
        let mut device_ids = std::collections::HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.id.as_str()) {
                return Err(GatewayError::config(format!(
                    "port {}: duplicate device id {:?}",
                    self.name, device.id
                )));
            }
            device.validate()?;
        }
        Ok(())
    }

    pub fn build_transport(&self) -> Result<Box<dyn Transport>> {
        match &self.transport {
            TransportConfig::Serial(c) => Ok(Box::new(
                SerialTransport::new(c.clone()).map_err(|e| GatewayError::config(e.to_string()))?,
            )),
            TransportConfig::Tcp(c) => Ok(Box::new(
                TcpTransport::new(c.clone()).map_err(|e| GatewayError::config(e.to_string()))?,
            )),
        }
    }

    /// Build the port's devices, interning registers through `bank`.
    pub fn build_devices(
        &self,
        registry: &CodecRegistry,
        bank: &RegisterBank,
    ) -> Result<Vec<Arc<Device>>> {
        self.devices
            .iter()
            .map(|d| d.build(registry, bank))
            .collect()
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(GatewayError::config("device id cannot be empty"));
        }
        if self.registers.is_empty() && self.setup.is_empty() {
            return Err(GatewayError::config(format!(
                "device {}: neither registers nor setup configured",
                self.id
            )));
        }
        if self.max_read_registers == 0 {
            return Err(GatewayError::config(format!(
                "device {}: max_read_registers cannot be zero",
                self.id
            )));
        }
        if let Some(line) = &self.line {
            line.validate()
                .map_err(|e| GatewayError::config(format!("device {}: {e}", self.id)))?;
        }
        let mut names = std::collections::HashSet::new();
        for reg in &self.registers {
            if !names.insert(reg.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "device {}: duplicate register name {:?}",
                    self.id, reg.name
                )));
            }
            if reg.read_period_ms == Some(0) {
                return Err(GatewayError::config(format!(
                    "device {}: register {}: read period cannot be zero",
                    self.id, reg.name
                )));
            }
        }
        Ok(())
    }

    fn timings(&self) -> DeviceTimings {
        DeviceTimings {
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            request_delay: Duration::from_millis(self.request_delay_ms),
            inter_device_delay: Duration::from_millis(self.inter_device_delay_ms),
            device_timeout: Duration::from_millis(self.device_timeout_ms),
            max_fail_cycles: self.max_fail_cycles,
        }
    }

    pub fn build(&self, registry: &CodecRegistry, bank: &RegisterBank) -> Result<Arc<Device>> {
        let codec = registry.get(&self.protocol).ok_or_else(|| {
            GatewayError::config(format!(
                "device {}: unknown protocol {:?} (available: {})",
                self.id,
                self.protocol,
                registry.names().join(", ")
            ))
        })?;

        let mut registers = Vec::with_capacity(self.registers.len());
        for reg in &self.registers {
            let reg_type = codec.reg_type_from_str(&reg.reg_type).ok_or_else(|| {
                GatewayError::config(format!(
                    "device {}: register {}: unknown register type {:?} for protocol {}",
                    self.id, reg.name, reg.reg_type, self.protocol
                ))
            })?;
            codec
                .validate_register(reg_type, reg.address, reg.format.width_words())
                .map_err(|e| {
                    GatewayError::config(format!(
                        "device {}: register {}: {e}",
                        self.id, reg.name
                    ))
                })?;
            if self.max_read_registers > codec.max_read_count(reg_type) {
                return Err(GatewayError::config(format!(
                    "device {}: max_read_registers {} exceeds the {} cap of {} for {:?} reads",
                    self.id,
                    self.max_read_registers,
                    self.protocol,
                    codec.max_read_count(reg_type),
                    reg.reg_type
                )));
            }
            let bit_width = reg
                .bit_width
                .unwrap_or_else(|| reg.format.width_bytes() * 8);
            let key = RegisterKey {
                device: self.id.clone(),
                reg_type,
                address: reg.address,
                bit_offset: reg.bit_offset,
                bit_width,
            };
            let interned = bank.intern(key.clone(), || {
                Register::new(
                    key.clone(),
                    reg.format,
                    reg.word_order,
                    reg.scale,
                    reg.offset,
                    reg.read_period_ms.map(Duration::from_millis),
                    reg.sporadic,
                    reg.poll,
                )
            })?;
            registers.push(interned);
        }

        let mut setup_items = Vec::with_capacity(self.setup.len());
        for item in &self.setup {
            let reg_type = codec.reg_type_from_str(&item.reg_type).ok_or_else(|| {
                GatewayError::config(format!(
                    "device {}: setup {}: unknown register type {:?}",
                    self.id, item.name, item.reg_type
                ))
            })?;
            codec
                .validate_register(reg_type, item.address, item.format.width_words())
                .map_err(|e| {
                    GatewayError::config(format!("device {}: setup {}: {e}", self.id, item.name))
                })?;
            let key = RegisterKey {
                device: self.id.clone(),
                reg_type,
                address: item.address,
                bit_offset: 0,
                bit_width: item.format.width_bytes() * 8,
            };
            let register = bank.intern(key.clone(), || {
                Register::new(
                    key.clone(),
                    item.format,
                    WordOrder::default(),
                    1.0,
                    0.0,
                    None,
                    SporadicMode::Disabled,
                    false,
                )
            })?;
            setup_items.push(SetupItem {
                name: item.name.clone(),
                register,
                value: item.value,
            });
        }

        Ok(Arc::new(Device::new(
            self.id.clone(),
            self.protocol.clone(),
            self.slave_id,
            self.timings(),
            self.line,
            self.max_register_hole,
            self.max_read_registers,
            Duration::from_millis(self.events_poll_interval_ms),
            registers,
            setup_items,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
ports:
  - name: rs485-1
    transport: serial
    path: /dev/ttyRS485-1
    baud_rate: 9600
    data_bits: 8
    stop_bits: 1
    parity: none
    devices:
      - id: meter1
        slave_id: 1
        setup:
          - name: mode
            address: 0
            value: 1
        registers:
          - name: voltage
            reg_type: input
            address: 10
            format: u32
            scale: 0.001
            read_period_ms: 100
          - name: total_energy
            reg_type: input
            address: 20
            format: u64
  - name: gateway-tcp
    transport: tcp
    host: 10.0.0.5
    port: 502
    devices:
      - id: io1
        protocol: modbus_tcp
        slave_id: 3
        registers:
          - name: relay
            reg_type: coil
            address: 0
            format: u8
"#;

    fn parse(yaml: &str) -> GatewayConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn parses_and_validates_sample() {
        let config = parse(SAMPLE);
        config.validate().unwrap();
        assert_eq!(config.ports.len(), 2);
        let meter = &config.ports[0].devices[0];
        assert_eq!(meter.protocol, "modbus_rtu");
        assert_eq!(meter.response_timeout_ms, 500);
        assert_eq!(meter.registers[0].read_period_ms, Some(100));
        assert_eq!(meter.registers[1].read_period_ms, None);
        assert!(matches!(
            config.ports[1].transport,
            TransportConfig::Tcp(_)
        ));
    }

    #[test]
    fn builds_devices_with_interned_registers() {
        let config = parse(SAMPLE);
        let registry = CodecRegistry::with_builtin();
        let bank = RegisterBank::new();
        let devices = config.ports[0].build_devices(&registry, &bank).unwrap();
        assert_eq!(devices.len(), 1);
        let dev = &devices[0];
        assert_eq!(dev.registers().len(), 2);
        assert_eq!(dev.setup_items().len(), 1);
        // 2 registers + 1 setup register interned.
        assert_eq!(bank.len(), 3);
        assert_eq!(dev.registers()[0].read_period(), Some(Duration::from_millis(100)));
        assert!(!dev.setup_items()[0].register.is_poll_enabled());
    }

    #[test]
    fn rejects_duplicate_device_ids() {
        let mut config = parse(SAMPLE);
        let dup = config.ports[0].devices[0].clone();
        config.ports[0].devices.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_read_period() {
        let mut config = parse(SAMPLE);
        config.ports[0].devices[0].registers[0].read_period_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_register_type_at_build() {
        let mut config = parse(SAMPLE);
        config.ports[0].devices[0].registers[0].reg_type = "flux".to_string();
        let registry = CodecRegistry::with_builtin();
        let bank = RegisterBank::new();
        assert!(config.ports[0].build_devices(&registry, &bank).is_err());
    }

    #[test]
    fn rejects_address_beyond_protocol_range() {
        let mut config = parse(SAMPLE);
        config.ports[0].devices[0].registers[0].address = 65537;
        let registry = CodecRegistry::with_builtin();
        let bank = RegisterBank::new();
        let err = config.ports[0].build_devices(&registry, &bank).unwrap_err();
        assert!(err.to_string().contains("16-bit address space"), "{err}");
        assert!(config.dry_build().is_err());
    }

    #[test]
    fn rejects_multiword_register_running_past_the_address_space() {
        let mut config = parse(SAMPLE);
        // "voltage" is a u32: two words starting at the last address.
        config.ports[0].devices[0].registers[0].address = 0xFFFF;
        assert!(config.dry_build().is_err());
    }

    #[test]
    fn rejects_setup_address_beyond_protocol_range() {
        let mut config = parse(SAMPLE);
        config.ports[0].devices[0].setup[0].address = 0x1_0000;
        assert!(config.dry_build().is_err());
    }

    #[test]
    fn read_cap_is_checked_per_register_type() {
        // 200 word registers per read exceeds the 0x7D cap...
        let mut config = parse(SAMPLE);
        config.ports[0].devices[0].max_read_registers = 200;
        assert!(config.dry_build().is_err());

        // ...while 200 coils per read is well within the bit-read cap.
        let mut config = parse(SAMPLE);
        config.ports[1].devices[0].max_read_registers = 200;
        assert!(config.dry_build().is_ok());
    }

    #[test]
    fn loads_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.ports.len(), 2);
    }

    #[test]
    fn rejects_unsupported_extension() {
        assert!(GatewayConfig::load(Path::new("/tmp/config.ini")).is_err());
    }
}
