//! Lease extension.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Error;

use super::{request::Request, response::Response, system::SystemView};

#[derive(Debug, Clone, Copy, bon::Builder)]
#[builder(derive(Clone))]
pub struct LeaseInputs {
    #[builder(default)]
    pub backend_increment: TimeDelta,
    #[builder(default)]
    pub backend_max: TimeDelta,
    pub mount_default: TimeDelta,
    pub mount_max: TimeDelta,
    #[builder(default)]
    pub user_increment: TimeDelta,
    pub issue_time: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Computes the TTL for a new or renewed lease.
///
/// The result is always positive and never carries the lease past
/// `issue_time` plus the effective maximum.
pub fn calculate_ttl(inputs: LeaseInputs) -> Result<TimeDelta, Error> {
    let zero = TimeDelta::zero();

    let max = if inputs.backend_max > zero {
        inputs.mount_max.min(inputs.backend_max)
    } else {
        inputs.mount_max
    };
    if max <= zero {
        return Err(Error::validation(format!(
            "max TTL must be positive, got {}s",
            max.num_seconds()
        )));
    }

    let max_valid_time = inputs.issue_time + max;
    if max_valid_time <= inputs.now {
        return Err(Error::PastMaxTtl);
    }

    let increment = [
        inputs.user_increment,
        inputs.backend_increment,
        inputs.mount_default,
    ]
    .into_iter()
    .find(|i| *i > zero)
    .ok_or_else(|| Error::validation("no positive lease increment is configured"))?;

    if inputs.now + increment > max_valid_time {
        return Ok(max_valid_time - inputs.now);
    }

    Ok(increment)
}

/// Renews the lease carried by `req` and returns it with the new TTL.
pub fn extend(
    req: &Request,
    backend_increment: TimeDelta,
    backend_max: TimeDelta,
    system: &dyn SystemView,
    now: DateTime<Utc>,
) -> Result<Option<Response>, Error> {
    let mut lease = req
        .secret
        .clone()
        .ok_or_else(|| Error::validation("request has no lease to renew"))?;

    let ttl = calculate_ttl(
        LeaseInputs::builder()
            .backend_increment(backend_increment)
            .backend_max(backend_max)
            .mount_default(system.default_lease_ttl())
            .mount_max(system.max_lease_ttl())
            .user_increment(lease.increment)
            .issue_time(lease.issue_time.unwrap_or(now))
            .now(now)
            .build(),
    )?;

    lease.ttl = ttl;
    if backend_max > TimeDelta::zero() {
        lease.max_ttl = backend_max;
    }

    Ok(Some(Response {
        secret: Some(lease),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_clamped_to_max_valid_time() {
        let ttl = calculate_ttl(
            LeaseInputs::builder()
                .mount_default(TimeDelta::hours(1))
                .mount_max(TimeDelta::hours(30))
                .user_increment(TimeDelta::hours(10))
                .issue_time(now() - TimeDelta::hours(25))
                .now(now())
                .build(),
        )
        .unwrap();

        assert_eq!(ttl, TimeDelta::hours(5));
    }

    #[test]
    fn test_increment_precedence() {
        let base = LeaseInputs::builder()
            .mount_default(TimeDelta::hours(1))
            .mount_max(TimeDelta::hours(100))
            .issue_time(now())
            .now(now());

        assert_eq!(calculate_ttl(base.clone().build()).unwrap(), TimeDelta::hours(1));

        let backend = base
            .clone()
            .backend_increment(TimeDelta::hours(2))
            .build();
        assert_eq!(calculate_ttl(backend).unwrap(), TimeDelta::hours(2));

        let user = LeaseInputs {
            user_increment: TimeDelta::hours(3),
            ..backend
        };
        assert_eq!(calculate_ttl(user).unwrap(), TimeDelta::hours(3));
    }

    #[test]
    fn test_backend_max_caps_mount_max() {
        let ttl = calculate_ttl(
            LeaseInputs::builder()
                .backend_max(TimeDelta::hours(2))
                .mount_default(TimeDelta::hours(10))
                .mount_max(TimeDelta::hours(30))
                .issue_time(now())
                .now(now())
                .build(),
        )
        .unwrap();

        assert_eq!(ttl, TimeDelta::hours(2));
    }

    #[test]
    fn test_past_max_ttl() {
        let result = calculate_ttl(
            LeaseInputs::builder()
                .mount_default(TimeDelta::hours(1))
                .mount_max(TimeDelta::hours(2))
                .issue_time(now() - TimeDelta::hours(3))
                .now(now())
                .build(),
        );

        assert!(matches!(result, Err(Error::PastMaxTtl)));
    }

    #[test]
    fn test_non_positive_max_is_error() {
        let result = calculate_ttl(
            LeaseInputs::builder()
                .mount_default(TimeDelta::hours(1))
                .mount_max(TimeDelta::zero())
                .issue_time(now())
                .now(now())
                .build(),
        );

        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    proptest! {
        #[test]
        fn prop_ttl_bounds(
            backend_increment in 0i64..200_000,
            backend_max in 0i64..200_000,
            mount_default in 1i64..200_000,
            mount_max in 1i64..200_000,
            user_increment in 0i64..200_000,
            age in 0i64..200_000,
        ) {
            let inputs = LeaseInputs {
                backend_increment: TimeDelta::seconds(backend_increment),
                backend_max: TimeDelta::seconds(backend_max),
                mount_default: TimeDelta::seconds(mount_default),
                mount_max: TimeDelta::seconds(mount_max),
                user_increment: TimeDelta::seconds(user_increment),
                issue_time: now() - TimeDelta::seconds(age),
                now: now(),
            };

            let max = if backend_max > 0 { mount_max.min(backend_max) } else { mount_max };
            let remaining = max - age;

            match calculate_ttl(inputs) {
                Ok(ttl) => {
                    let ttl = ttl.num_seconds();
                    prop_assert!(ttl > 0);
                    prop_assert!(ttl <= remaining);

                    let wanted = if user_increment > 0 {
                        user_increment
                    } else if backend_increment > 0 {
                        backend_increment
                    } else {
                        mount_default
                    };
                    prop_assert_eq!(ttl, wanted.min(remaining));
                }
                Err(e) => {
                    prop_assert!(remaining <= 0);
                    prop_assert!(matches!(e, Error::PastMaxTtl));
                }
            }
        }
    }
}
