//! Lease-based leader election
//!
//! Singleton handlers run only while this process holds a coordination Lease.
//! Losing the lease cancels the guarded work and surfaces
//! [`Error::LeadershipLost`] so the process restarts cleanly.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lease timing
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    /// Holder identity, usually the pod name
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub retry_period: Duration,
}

impl LeaseConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Whether `identity` may take or keep a lease in state `spec` at `now`
pub fn can_acquire(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>, default_duration: Duration) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    match spec.holder_identity.as_deref() {
        None | Some("") => return true,
        Some(holder) if holder == identity => return true,
        Some(_) => {}
    }
    let Some(MicroTime(renewed)) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let seconds = spec
        .lease_duration_seconds
        .map(i64::from)
        .unwrap_or(default_duration.as_secs() as i64);
    *renewed + ChronoDuration::seconds(seconds) < now
}

/// Acquires and renews one Lease
pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaseConfig,
}

impl LeaderElector {
    pub fn new(client: kube::Client, config: LeaseConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
        }
    }

    /// Block until the lease is held, run `work`, and keep renewing.
    ///
    /// Returns `Ok` when `cancel` fires or `work` finishes, and
    /// `Err(LeadershipLost)` when renewal fails.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, work: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(lease = %self.config.name, error = %e, "lease acquisition failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
        info!(lease = %self.config.name, identity = %self.config.identity, "acquired leadership");

        let guarded = cancel.child_token();
        let work = work(guarded.clone());
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.config.renew_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut work => return Ok(()),
                _ = ticker.tick() => {
                    let renewed = match self.try_acquire_or_renew().await {
                        Ok(renewed) => renewed,
                        Err(e) => {
                            warn!(lease = %self.config.name, error = %e, "lease renewal failed");
                            false
                        }
                    };
                    if !renewed && !cancel.is_cancelled() {
                        guarded.cancel();
                        work.await;
                        return Err(Error::LeadershipLost(self.config.name.clone()));
                    }
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let duration_secs = self.config.lease_duration.as_secs() as i32;

        let Some(mut lease) = self.api.get_opt(&self.config.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.config.name.clone()),
                    namespace: Some(self.config.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.config.identity.clone()),
                    lease_duration_seconds: Some(duration_secs),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        if !can_acquire(lease.spec.as_ref(), &self.config.identity, now, self.config.lease_duration) {
            return Ok(false);
        }

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            spec.holder_identity = Some(self.config.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(duration_secs);

        match self
            .api
            .replace(&self.config.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: Duration = Duration::from_secs(15);

    fn held_by(holder: &str, renewed: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            renew_time: Some(MicroTime(renewed)),
            lease_duration_seconds: Some(15),
            ..Default::default()
        }
    }

    #[test]
    fn test_free_lease_is_acquirable() {
        let now = Utc::now();
        assert!(can_acquire(None, "a", now, DEFAULT));
        assert!(can_acquire(Some(&LeaseSpec::default()), "a", now, DEFAULT));
    }

    #[test]
    fn test_own_lease_is_renewable() {
        let now = Utc::now();
        assert!(can_acquire(Some(&held_by("a", now)), "a", now, DEFAULT));
    }

    #[test]
    fn test_foreign_lease_until_expiry() {
        let now = Utc::now();
        let spec = held_by("b", now - ChronoDuration::seconds(5));
        assert!(!can_acquire(Some(&spec), "a", now, DEFAULT));

        let spec = held_by("b", now - ChronoDuration::seconds(20));
        assert!(can_acquire(Some(&spec), "a", now, DEFAULT));
    }

    #[test]
    fn test_default_duration_applies() {
        let now = Utc::now();
        let spec = LeaseSpec {
            holder_identity: Some("b".into()),
            acquire_time: Some(MicroTime(now - ChronoDuration::seconds(10))),
            ..Default::default()
        };
        assert!(!can_acquire(Some(&spec), "a", now, DEFAULT));
        assert!(can_acquire(Some(&spec), "a", now, Duration::from_secs(5)));
    }
}
