//! Idempotent convergence of owned child objects
//!
//! [`converge`] takes a desired object and makes the live one match it with
//! the smallest write that will do:
//!
//! - missing objects are created with the sensor's owner reference;
//! - existing objects are compared on their kind's significant fields only,
//!   and all of those fields are copied over in a single update when any
//!   differ;
//! - fields the API server refuses to update in place either fail with
//!   [`Error::ImmutableField`] (workload selectors) or make the engine
//!   delete and recreate the object (role bindings, secret types, priority
//!   values).
//!
//! The set of kinds is closed: [`Convergent`] is sealed and implemented in
//! [`kinds`] for the child objects sensors own.

pub mod kinds;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::store::{Object, ObjectKey, StateStore};
use crate::{Error, Result};

mod sealed {
    pub trait Sealed {}
}

/// A child kind the engine knows how to converge
pub trait Convergent: Object + sealed::Sealed {
    /// Whether created objects get the sensor's owner reference
    const OWNED: bool = true;

    /// Whether the significant fields of `live` differ from `desired`
    fn drifted(live: &Self, desired: &Self) -> bool;

    /// Copy every significant field of `desired` onto `live`
    fn copy_significant(live: &mut Self, desired: &Self);

    /// Path of an immutable field that differs, if any
    fn immutable_conflict(_live: &Self, _desired: &Self) -> Option<&'static str> {
        None
    }

    /// Whether an identity-bearing field differs, forcing delete and recreate
    fn requires_replacement(_live: &Self, _desired: &Self) -> bool {
        false
    }
}

/// What a convergence step did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The object did not exist and was created
    Created,
    /// Significant fields drifted and were updated in place
    Updated,
    /// The object was deleted and recreated
    Replaced,
    /// Nothing to do
    Unchanged,
}

impl Outcome {
    /// Condition reason recorded for this outcome
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Replaced => "Replaced",
            Self::Unchanged => "Unchanged",
        }
    }
}

/// Result of converging one object
#[derive(Clone, Debug)]
pub struct Converged<K> {
    /// The object as the API server last returned it
    pub object: K,
    /// What was done
    pub outcome: Outcome,
}

impl<K> Converged<K> {
    /// Whether a write happened
    pub fn mutated(&self) -> bool {
        self.outcome != Outcome::Unchanged
    }
}

/// Converge the live counterpart of `desired`
///
/// `owner` is stamped on objects this call creates, unless the kind is
/// exempt from ownership. Errors carry the kind and name of the child.
pub async fn converge<K, S>(
    store: &S,
    owner: Option<&OwnerReference>,
    desired: K,
) -> Result<Converged<K>>
where
    K: Convergent,
    S: StateStore<K> + ?Sized,
{
    let kind = K::kind(&()).to_string();
    let name = desired.name_any();
    converge_object(store, owner, desired, &kind)
        .await
        .map_err(|e| Error::child(kind, name, e))
}

async fn converge_object<K, S>(
    store: &S,
    owner: Option<&OwnerReference>,
    desired: K,
    kind: &str,
) -> Result<Converged<K>>
where
    K: Convergent,
    S: StateStore<K> + ?Sized,
{
    let key = ObjectKey::of(&desired);

    let existing = match store.get(&key).await? {
        Some(live) => Some(live),
        None => store.get_latest(&key).await?,
    };

    let live = match existing {
        Some(live) => live,
        None => {
            let obj = with_owner(desired.clone(), owner);
            match store.create(&obj).await {
                Ok(created) => {
                    info!(kind, object = %key, "created child object");
                    return Ok(Converged {
                        object: created,
                        outcome: Outcome::Created,
                    });
                }
                Err(e) if e.is_already_exists() => {
                    debug!(kind, object = %key, "create raced with another writer, updating instead");
                    store.get_latest(&key).await?.ok_or_else(|| {
                        Error::internal_with_context(
                            "converge",
                            format!("{kind} {key} reported existing but cannot be read"),
                        )
                    })?
                }
                Err(e) => return Err(e),
            }
        }
    };

    if let Some(field) = K::immutable_conflict(&live, &desired) {
        return Err(Error::immutable_field(kind, &key.name, field));
    }

    if K::requires_replacement(&live, &desired) {
        info!(kind, object = %key, "identity field changed, recreating child object");
        store.delete(&key).await?;
        let mut obj = desired;
        obj.meta_mut().owner_references = live.meta().owner_references.clone();
        let obj = if obj.meta().owner_references.is_none() {
            with_owner(obj, owner)
        } else {
            obj
        };
        let created = store.create(&obj).await?;
        return Ok(Converged {
            object: created,
            outcome: Outcome::Replaced,
        });
    }

    if !K::drifted(&live, &desired) {
        return Ok(Converged {
            object: live,
            outcome: Outcome::Unchanged,
        });
    }

    let mut patched = live;
    K::copy_significant(&mut patched, &desired);
    let updated = store.update(&patched).await?;
    info!(kind, object = %key, "updated drifted child object");
    Ok(Converged {
        object: updated,
        outcome: Outcome::Updated,
    })
}

fn with_owner<K: Convergent>(mut obj: K, owner: Option<&OwnerReference>) -> K {
    if K::OWNED {
        if let Some(owner) = owner {
            obj.meta_mut().owner_references = Some(vec![owner.clone()]);
        }
    }
    obj
}

#[cfg(test)]
mod tests;
