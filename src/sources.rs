use anyhow::Result;

use crate::config::Config;
use crate::traits::ConnectorRegistry;

/// Print every registered connector and the configured connections using it.
pub fn list_connectors(config: &Config, registry: &ConnectorRegistry) -> Result<()> {
    println!("{:<12} {:<24} DESCRIPTION", "CONNECTOR", "CONNECTIONS");
    for connector in registry.connectors() {
        let used_by: Vec<&str> = config
            .connections
            .iter()
            .filter(|(_, c)| c.connector == connector.name())
            .map(|(name, _)| name.as_str())
            .collect();
        let used_by = if used_by.is_empty() {
            "-".to_string()
        } else {
            used_by.join(",")
        };
        println!(
            "{:<12} {:<24} {}",
            connector.name(),
            used_by,
            connector.description()
        );
    }

    for (name, conn) in &config.connections {
        if registry.get(&conn.connector).is_none() {
            println!("warning: connection '{}' uses unknown connector '{}'", name, conn.connector);
        }
    }
    Ok(())
}
