//! Membership service configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GmsError, GmsResult};

/// Group membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmsConfig {
    /// Wait for a join response
    pub join_timeout: Duration,

    /// Pause between join rounds that made no progress
    pub join_retry_timeout: Duration,

    /// Join rounds before falling back to a singleton cluster
    pub join_retry_count: u32,

    /// Wait for discovery responses
    pub discovery_timeout: Duration,

    /// Wait for a leave acknowledgement
    pub leave_timeout: Duration,

    /// Coordinators tried when leaving
    pub leave_attempts: u32,

    /// Wait for the application to hand over its digest
    pub digest_timeout: Duration,

    /// Wait for merge responses
    pub merge_timeout: Duration,

    /// Wait for view acknowledgements per broadcast attempt
    pub view_ack_timeout: Duration,

    /// Wait per hash distribution attempt
    pub hash_distribution_timeout: Duration,

    /// Hash distribution attempts before proceeding without one
    pub hash_distribution_attempts: u32,

    /// Wait for state transfer answers
    pub state_transfer_query_timeout: Duration,

    /// Age after which a state transfer mark is considered stale
    pub state_transfer_expiry: Duration,

    /// Never bootstrap a singleton cluster
    pub disable_initial_coordinator: bool,

    /// Leave when a newer view excludes this node
    pub leave_on_exclusion: bool,

    /// Previous members remembered for exclusion checks
    pub num_prev_members: usize,
}

impl Default for GmsConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_millis(3000),
            join_retry_timeout: Duration::from_millis(1000),
            join_retry_count: 20,
            discovery_timeout: Duration::from_millis(2000),
            leave_timeout: Duration::from_millis(5000),
            leave_attempts: 3,
            digest_timeout: Duration::from_millis(5000),
            merge_timeout: Duration::from_millis(10000),
            view_ack_timeout: Duration::from_millis(15000),
            hash_distribution_timeout: Duration::from_millis(3000),
            hash_distribution_attempts: 3,
            state_transfer_query_timeout: Duration::from_millis(3000),
            state_transfer_expiry: Duration::from_secs(20),
            disable_initial_coordinator: false,
            leave_on_exclusion: false,
            num_prev_members: 50,
        }
    }
}

impl GmsConfig {
    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> GmsResult<()> {
        let timeouts = [
            ("join_timeout", self.join_timeout),
            ("discovery_timeout", self.discovery_timeout),
            ("leave_timeout", self.leave_timeout),
            ("digest_timeout", self.digest_timeout),
            ("merge_timeout", self.merge_timeout),
            ("view_ack_timeout", self.view_ack_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(GmsError::Configuration(format!("{name} must be non-zero")));
            }
        }

        if self.join_retry_count == 0 {
            return Err(GmsError::Configuration(
                "join_retry_count must be at least 1".to_string(),
            ));
        }
        if self.leave_attempts == 0 {
            return Err(GmsError::Configuration(
                "leave_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Short timeouts for in-process clusters
    pub fn for_testing() -> Self {
        Self {
            join_timeout: Duration::from_millis(500),
            join_retry_timeout: Duration::from_millis(100),
            join_retry_count: 5,
            discovery_timeout: Duration::from_millis(200),
            leave_timeout: Duration::from_millis(500),
            digest_timeout: Duration::from_millis(500),
            merge_timeout: Duration::from_millis(1000),
            view_ack_timeout: Duration::from_millis(1000),
            hash_distribution_timeout: Duration::from_millis(200),
            state_transfer_query_timeout: Duration::from_millis(300),
            ..Self::default()
        }
    }
}
