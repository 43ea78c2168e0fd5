//! Idempotent resource reconciliation.
//!
//! Every reconciler goes through [`ensure_exists`]: look the resource up, accept
//! it if it already has the desired shape, refuse it if it does not, create it
//! if it is absent. Re-running a reconciler on converged state performs no
//! mutation.

pub mod device;
pub mod image;
pub mod instance;
pub mod network;
pub mod profile;
pub mod volume;

use crate::error::{ResourceKind, Result, StackError};
use std::future::Future;
use tracing::{debug, info};

/// Outcome of [`ensure_exists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// The resource was already there in the desired shape.
    Existing,
    /// The resource was created by this call.
    Created,
}

impl Ensured {
    pub fn created(&self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Whether an existing resource matches what the stack declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Desired,
    Differs(String),
}

impl Shape {
    pub fn check(ok: bool, reason: impl FnOnce() -> String) -> Self {
        if ok {
            Self::Desired
        } else {
            Self::Differs(reason())
        }
    }
}

/// Make sure the resource `kind`/`name` exists.
///
/// `lookup` resolves to the current remote state. An existing resource is
/// judged by `is_desired`: a match is a no-op, a mismatch is a `Conflict`. An
/// absent resource is created with `create`; an `AlreadyExists` answer from the
/// create (someone else won the race) counts as existing.
pub async fn ensure_exists<T, Lookup, Create, Fut>(
    kind: ResourceKind,
    name: &str,
    lookup: Lookup,
    is_desired: impl FnOnce(&T) -> Shape,
    create: Create,
) -> Result<Ensured>
where
    Lookup: Future<Output = Result<Option<T>>>,
    Create: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if let Some(current) = lookup.await? {
        return match is_desired(&current) {
            Shape::Desired => {
                info!("{} '{}' already exists, skipping", kind, name);
                Ok(Ensured::Existing)
            }
            Shape::Differs(reason) => {
                Err(StackError::Conflict { kind, name: name.to_string(), reason })
            }
        };
    }

    match create().await {
        Ok(()) => {
            info!("Created {} '{}'", kind, name);
            Ok(Ensured::Created)
        }
        Err(e) if e.is_already_exists() => {
            debug!("{} '{}' appeared concurrently, treating as existing", kind, name);
            Ok(Ensured::Existing)
        }
        Err(e) => Err(e),
    }
}
