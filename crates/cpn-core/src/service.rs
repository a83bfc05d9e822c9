//! Anycast service catalogue

use cpn_types::{ServiceId, ServiceInstance};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AnycastConfig;

/// Instance with the name used by the signal tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedInstance {
    pub name: String,
    pub instance: ServiceInstance,
}

/// What sits behind one anycast service identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub description: String,

    /// Ordered pool; the order is the policy column order
    pub instances: Vec<NamedInstance>,
}

impl ServiceDescriptor {
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.instances.iter().map(|n| n.instance).collect()
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.instances.iter().map(|n| n.name.clone()).collect()
    }
}

/// Registry of anycast services
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalogue {
    services: Arc<RwLock<BTreeMap<ServiceId, ServiceDescriptor>>>,
}

impl ServiceCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalogue from configuration
    pub fn from_config(config: &AnycastConfig) -> Self {
        let catalogue = Self::new();
        for service in &config.services {
            let descriptor = ServiceDescriptor {
                description: service.description.clone(),
                instances: service
                    .instances
                    .iter()
                    .map(|i| NamedInstance {
                        name: i.name.clone(),
                        instance: ServiceInstance::new(i.ip, i.port),
                    })
                    .collect(),
            };
            catalogue.register(service.service_id(), descriptor);
        }
        catalogue
    }

    /// Register a service, replacing any previous descriptor
    pub fn register(&self, id: ServiceId, descriptor: ServiceDescriptor) {
        let mut services = self.services.write();
        info!(
            service = %id,
            instances = descriptor.instances.len(),
            description = %descriptor.description,
            "Registering anycast service"
        );
        if services.insert(id, descriptor).is_some() {
            warn!(service = %id, "Replaced existing service descriptor");
        }
    }

    pub fn get(&self, id: &ServiceId) -> Option<ServiceDescriptor> {
        self.services.read().get(id).cloned()
    }

    /// Instance pool of a service
    pub fn instances(&self, id: &ServiceId) -> Option<Vec<ServiceInstance>> {
        self.services.read().get(id).map(ServiceDescriptor::instances)
    }

    /// Whether `ip` is the anycast address of any registered service
    pub fn is_anycast_ip(&self, ip: Ipv4Addr) -> bool {
        self.services.read().keys().any(|id| id.ip == ip)
    }

    /// All registered service identifiers, ordered
    pub fn services(&self) -> Vec<ServiceId> {
        self.services.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;

    #[test]
    fn test_catalogue_from_default_config() {
        let config = ControllerConfig::default();
        let catalogue = ServiceCatalogue::from_config(&config.anycast);

        let id = ServiceId::tcp(Ipv4Addr::new(192, 168, 255, 1), 8000);
        assert_eq!(catalogue.services(), vec![id]);
        assert!(catalogue.is_anycast_ip(Ipv4Addr::new(192, 168, 255, 1)));
        assert!(!catalogue.is_anycast_ip(Ipv4Addr::new(10, 0, 0, 7)));

        let instances = catalogue.instances(&id).unwrap();
        assert_eq!(instances[0], ServiceInstance::new(Ipv4Addr::new(10, 0, 0, 7), 8000));
        assert_eq!(catalogue.get(&id).unwrap().instance_names()[3], "primeApp4");
    }

    #[test]
    fn test_register_replaces() {
        let catalogue = ServiceCatalogue::new();
        let id = ServiceId::udp(Ipv4Addr::new(192, 168, 255, 2), 53);
        let one = ServiceDescriptor {
            description: "dns".into(),
            instances: vec![NamedInstance {
                name: "a".into(),
                instance: ServiceInstance::new(Ipv4Addr::new(10, 0, 0, 2), 53),
            }],
        };
        catalogue.register(id, one.clone());

        let mut two = one;
        two.description = "dns-v2".into();
        catalogue.register(id, two);

        assert_eq!(catalogue.len(), 1);
        assert_eq!(catalogue.get(&id).unwrap().description, "dns-v2");
        assert!(catalogue.instances(&ServiceId::tcp(Ipv4Addr::new(192, 168, 255, 2), 53)).is_none());
    }
}
