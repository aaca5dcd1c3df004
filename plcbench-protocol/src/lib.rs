//! Protocol adapters for plcbench.
//!
//! Each adapter drives one communication path to the controller behind the common
//! [`ProtocolAdapter`] contract: the JSON-RPC Web API, OPC UA binary and S7.

pub mod adapter;
pub mod opcua;
pub mod s7;
pub mod webapi;

pub use adapter::{measure, ProtocolAdapter, Timed};
pub use opcua::OpcUaAdapter;
pub use s7::S7Adapter;
pub use webapi::WebApiAdapter;

use plcbench_common::{BenchSettings, Protocol};

/// Build the adapter for `protocol` from the loaded settings
pub fn create_adapter(protocol: Protocol, settings: &BenchSettings) -> Box<dyn ProtocolAdapter> {
    let bulk_variable = settings.scenarios.bulk_variable.clone();
    match protocol {
        Protocol::WebApi => Box::new(WebApiAdapter::new(settings.webapi.clone(), bulk_variable)),
        Protocol::OpcUa => Box::new(OpcUaAdapter::new(
            settings.opcua.clone(),
            settings.declared_types(),
            bulk_variable,
        )),
        Protocol::S7 => Box::new(S7Adapter::new(settings.s7.clone(), settings.declared_types())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_adapter_names_match_protocols() {
        let settings = BenchSettings::default();
        for protocol in Protocol::ALL {
            let adapter = create_adapter(protocol, &settings);
            assert_eq!(adapter.name(), protocol.name());
            assert!(!adapter.is_connected());
        }
    }
}
