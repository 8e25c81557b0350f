// Daycare registry: who is alive, what they serve, and weighted routing.
//
// The map lives behind the registry's own lock; callers only see insert,
// assign, and snapshot, and never hold the lock themselves.
use chrono::{Duration, Utc};
use codegrinder_common::types::{MAX_CLOCK_DRIFT_SECONDS, REGISTRATION_INTERVAL_SECONDS};
use codegrinder_common::{DaycareRegistration, Version};
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("signature mismatch: computed {computed} but found {found}")]
    BadSignature { computed: String, found: String },
    #[error("version mismatch: daycare is {daycare}, but ta is {ta}")]
    VersionMismatch { daycare: String, ta: String },
    #[error("time drift is too great")]
    ClockDrift,
    #[error("no eligible daycare found")]
    NoEligibleDaycare,
}

pub struct Registry {
    secret: Vec<u8>,
    daycares: Mutex<HashMap<String, DaycareRegistration>>,
}

impl Registry {
    pub fn new(secret: Vec<u8>) -> Self {
        Registry {
            secret,
            daycares: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a registration after checking its signature, version, and
    /// clock drift. Accepted entries are re-stamped with local time so
    /// expiry does not depend on the daycare's clock.
    pub async fn insert(&self, mut reg: DaycareRegistration) -> Result<(), RegistryError> {
        let computed = reg.compute_signature(&self.secret);
        if computed != reg.signature {
            return Err(RegistryError::BadSignature {
                computed,
                found: reg.signature,
            });
        }
        let current = Version::current().version;
        if reg.version != current {
            return Err(RegistryError::VersionMismatch {
                daycare: reg.version,
                ta: current,
            });
        }
        if (Utc::now() - reg.time).num_seconds().abs() > MAX_CLOCK_DRIFT_SECONDS {
            return Err(RegistryError::ClockDrift);
        }

        reg.problem_types.sort();
        reg.time = Utc::now();
        reg.version.clear();
        reg.signature.clear();

        let mut daycares = self.daycares.lock().await;
        expire_locked(&mut daycares);
        if !daycares.contains_key(&reg.hostname) {
            info!(hostname = %reg.hostname, capacity = reg.capacity, "daycare registered");
        }
        daycares.insert(reg.hostname.clone(), reg);
        Ok(())
    }

    /// The live registrations, with stale entries evicted first.
    pub async fn snapshot(&self) -> HashMap<String, DaycareRegistration> {
        let mut daycares = self.daycares.lock().await;
        expire_locked(&mut daycares);
        daycares.clone()
    }

    /// Pick a host for the problem type, weighted by advertised capacity:
    /// a uniform point in the total weight, then a cumulative walk.
    pub async fn assign(&self, problem_type: &str) -> Result<String, RegistryError> {
        let mut daycares = self.daycares.lock().await;
        expire_locked(&mut daycares);

        let total: u64 = daycares
            .values()
            .filter(|reg| serves(reg, problem_type))
            .map(|reg| u64::from(reg.capacity))
            .sum();
        if total == 0 {
            return Err(RegistryError::NoEligibleDaycare);
        }

        let point = rand::thread_rng().gen_range(0..total);
        let mut skipped = 0u64;
        for (hostname, reg) in daycares.iter() {
            if serves(reg, problem_type) {
                skipped += u64::from(reg.capacity);
            }
            if point < skipped {
                return Ok(hostname.clone());
            }
        }
        Err(RegistryError::NoEligibleDaycare)
    }

    #[cfg(test)]
    async fn backdate(&self, hostname: &str, seconds: i64) {
        let mut daycares = self.daycares.lock().await;
        if let Some(reg) = daycares.get_mut(hostname) {
            reg.time -= Duration::seconds(seconds);
        }
    }
}

/// Eligibility uses binary search: insert keeps the list sorted.
fn serves(reg: &DaycareRegistration, problem_type: &str) -> bool {
    reg.problem_types
        .binary_search_by(|pt| pt.as_str().cmp(problem_type))
        .is_ok()
}

fn expire_locked(daycares: &mut HashMap<String, DaycareRegistration>) {
    let cutoff = Duration::seconds(2 * REGISTRATION_INTERVAL_SECONDS);
    daycares.retain(|hostname, reg| {
        let live = Utc::now() - reg.time <= cutoff;
        if !live {
            info!(hostname = %hostname, "daycare registration expired");
        }
        live
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"registry test secret";

    fn make_registration(hostname: &str, capacity: u32, problem_types: &[&str]) -> DaycareRegistration {
        let mut reg = DaycareRegistration {
            hostname: hostname.to_string(),
            problem_types: problem_types.iter().map(|s| s.to_string()).collect(),
            capacity,
            time: Utc::now(),
            version: Version::current().version,
            signature: String::new(),
        };
        reg.signature = reg.compute_signature(SECRET);
        reg
    }

    fn make_registry() -> Registry {
        Registry::new(SECRET.to_vec())
    }

    #[tokio::test]
    async fn test_insert_and_snapshot() {
        let registry = make_registry();
        registry
            .insert(make_registration("day1", 1, &["gounittest"]))
            .await
            .unwrap();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        let entry = &snapshot["day1"];
        // version and signature are scrubbed on accept
        assert!(entry.version.is_empty());
        assert!(entry.signature.is_empty());
    }

    #[tokio::test]
    async fn test_insert_rejects_bad_signature() {
        let registry = make_registry();
        let mut reg = make_registration("day1", 1, &["gounittest"]);
        reg.capacity = 100; // tamper after signing
        assert!(matches!(
            registry.insert(reg).await,
            Err(RegistryError::BadSignature { .. })
        ));
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_insert_rejects_version_mismatch() {
        let registry = make_registry();
        let mut reg = make_registration("day1", 1, &["gounittest"]);
        reg.version = "0.0.1".to_string();
        reg.signature = reg.compute_signature(SECRET);
        assert!(matches!(
            registry.insert(reg).await,
            Err(RegistryError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_drift_boundary() {
        let registry = make_registry();

        // 59 seconds behind: accepted
        let mut reg = make_registration("slow", 1, &["gounittest"]);
        reg.time = Utc::now() - Duration::seconds(59);
        reg.signature = reg.compute_signature(SECRET);
        registry.insert(reg).await.unwrap();

        // 61 seconds behind: rejected
        let mut reg = make_registration("slower", 1, &["gounittest"]);
        reg.time = Utc::now() - Duration::seconds(61);
        reg.signature = reg.compute_signature(SECRET);
        assert!(matches!(
            registry.insert(reg).await,
            Err(RegistryError::ClockDrift)
        ));

        // 61 seconds ahead: also rejected
        let mut reg = make_registration("fast", 1, &["gounittest"]);
        reg.time = Utc::now() + Duration::seconds(61);
        reg.signature = reg.compute_signature(SECRET);
        assert!(matches!(
            registry.insert(reg).await,
            Err(RegistryError::ClockDrift)
        ));
    }

    #[tokio::test]
    async fn test_stale_entries_are_evicted_on_read() {
        let registry = make_registry();
        registry
            .insert(make_registration("day1", 1, &["gounittest"]))
            .await
            .unwrap();
        registry
            .insert(make_registration("day2", 1, &["gounittest"]))
            .await
            .unwrap();

        registry
            .backdate("day1", 2 * REGISTRATION_INTERVAL_SECONDS + 1)
            .await;
        let snapshot = registry.snapshot().await;
        assert!(!snapshot.contains_key("day1"));
        assert!(snapshot.contains_key("day2"));
    }

    #[tokio::test]
    async fn test_assign_respects_eligibility() {
        let registry = make_registry();
        registry
            .insert(make_registration("go-host", 1, &["gounittest"]))
            .await
            .unwrap();
        registry
            .insert(make_registration("py-host", 1, &["python3unittest"]))
            .await
            .unwrap();

        for _ in 0..100 {
            assert_eq!(registry.assign("gounittest").await.unwrap(), "go-host");
        }
        assert!(matches!(
            registry.assign("unknownType").await,
            Err(RegistryError::NoEligibleDaycare)
        ));
    }

    #[tokio::test]
    async fn test_assign_empty_registry() {
        let registry = make_registry();
        assert!(matches!(
            registry.assign("gounittest").await,
            Err(RegistryError::NoEligibleDaycare)
        ));
    }

    #[tokio::test]
    async fn test_assign_weighted_distribution() {
        let registry = make_registry();
        registry
            .insert(make_registration("big", 3, &["gounittest", "python3unittest"]))
            .await
            .unwrap();
        registry
            .insert(make_registration("small", 1, &["gounittest"]))
            .await
            .unwrap();

        let mut big = 0u32;
        let trials = 10_000;
        for _ in 0..trials {
            if registry.assign("gounittest").await.unwrap() == "big" {
                big += 1;
            }
        }
        let share = f64::from(big) / f64::from(trials);
        // capacity 3 vs 1: expect roughly 75%
        assert!(
            (0.73..=0.77).contains(&share),
            "big host share {share} outside expected band"
        );
    }

    #[tokio::test]
    async fn test_eligibility_survives_unsorted_registration() {
        let registry = make_registry();
        // insert() sorts, so binary-search eligibility must still find the
        // type even when the daycare announced them out of order
        registry
            .insert(make_registration(
                "day1",
                1,
                &["python3unittest", "gounittest", "cppinout"],
            ))
            .await
            .unwrap();
        assert_eq!(registry.assign("gounittest").await.unwrap(), "day1");
        assert_eq!(registry.assign("cppinout").await.unwrap(), "day1");
    }
}
