//! Membership service builder

use std::sync::Arc;

use crate::address::Address;
use crate::config::GmsConfig;
use crate::error::{GmsError, GmsResult};
use crate::gms::Gms;
use crate::policy::{StandardTopology, TopologyPolicy};
use crate::transport::{Application, GmsTransport};

/// Sub-group a node belongs to unless configured otherwise
pub const DEFAULT_SUBGROUP: &str = "default";

/// Builder for [`Gms`]
pub struct GmsBuilder<T, A>
where
    T: GmsTransport,
    A: Application,
{
    /// Local address
    local: Address,

    /// Configuration
    config: Option<GmsConfig>,

    /// Transport
    transport: Option<Arc<T>>,

    /// Application above membership
    application: Option<Arc<A>>,

    /// Topology rules
    policy: Option<Arc<dyn TopologyPolicy>>,

    /// Sub-group of the local node
    subgroup: Option<String>,
}

impl<T, A> GmsBuilder<T, A>
where
    T: GmsTransport,
    A: Application,
{
    /// Create a new builder for the node at `local`
    pub fn new(local: Address) -> Self {
        Self {
            local,
            config: None,
            transport: None,
            application: None,
            policy: None,
            subgroup: None,
        }
    }

    /// Set configuration
    pub fn with_config(mut self, config: GmsConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set transport
    pub fn with_transport(mut self, transport: Arc<T>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set application
    pub fn with_application(mut self, application: Arc<A>) -> Self {
        self.application = Some(application);
        self
    }

    /// Set topology rules
    pub fn with_policy(mut self, policy: Arc<dyn TopologyPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the local node's sub-group
    pub fn with_subgroup(mut self, subgroup: impl Into<String>) -> Self {
        self.subgroup = Some(subgroup.into());
        self
    }

    /// Build the membership service.
    ///
    /// Must be called within a tokio runtime, which runs the dispatcher and
    /// background role tasks.
    pub fn build(self) -> GmsResult<Gms<T, A>> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| GmsError::NoRuntime(e.to_string()))?;

        let config = self.config.unwrap_or_default();
        config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| GmsError::Configuration("Transport not set".to_string()))?;

        let application = self
            .application
            .ok_or_else(|| GmsError::Configuration("Application not set".to_string()))?;

        let subgroup = self
            .subgroup
            .unwrap_or_else(|| DEFAULT_SUBGROUP.to_string());
        if subgroup.is_empty() {
            return Err(GmsError::Configuration(
                "Sub-group name must not be empty".to_string(),
            ));
        }

        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(StandardTopology));

        Ok(Gms::new(
            self.local,
            subgroup,
            config,
            transport,
            application,
            policy,
        ))
    }
}
