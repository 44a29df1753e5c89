//! Per-model access control list.
//!
//! Each model has one owner and any number of delegates. Only they are authorized for the
//! model. An unowned model is claimable by its first submitter when open registration is
//! enabled; otherwise an administrator must [`ModelAcl::grant_owner`] first.

use crate::{AuthorizationPolicy, CallerId, ModelId, MonitorError, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::{debug, info};

#[derive(Clone, Debug)]
struct ModelGrant {
    owner: CallerId,
    delegates: BTreeSet<CallerId>,
}

pub struct ModelAcl {
    grants: RwLock<HashMap<ModelId, ModelGrant>>,
    open_registration: bool,
}

impl ModelAcl {
    pub fn new(open_registration: bool) -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
            open_registration,
        }
    }

    pub fn owner(&self, model_id: &ModelId) -> Option<CallerId> {
        let grants = self.grants.read().ok()?;
        grants.get(model_id).map(|g| g.owner.clone())
    }

    pub fn delegates(&self, model_id: &ModelId) -> Vec<CallerId> {
        match self.grants.read() {
            Ok(grants) => grants
                .get(model_id)
                .map(|g| g.delegates.iter().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Administrative assignment of an owner to a not-yet-owned model.
    ///
    /// Idempotent for the same owner; fails if another identity already owns the model.
    pub fn grant_owner(&self, model_id: &ModelId, owner: &CallerId) -> Result<()> {
        let mut grants = self.write()?;
        match grants.get(model_id) {
            Some(existing) if &existing.owner == owner => Ok(()),
            Some(_) => Err(MonitorError::Unauthorized {
                caller: owner.clone(),
                model_id: model_id.clone(),
            }),
            None => {
                grants.insert(
                    model_id.clone(),
                    ModelGrant {
                        owner: owner.clone(),
                        delegates: BTreeSet::new(),
                    },
                );
                info!(%model_id, %owner, "model owner granted");
                Ok(())
            }
        }
    }

    /// Owner-only: allow `delegate` to act on `model_id`.
    pub fn grant_delegate(
        &self,
        owner: &CallerId,
        model_id: &ModelId,
        delegate: &CallerId,
    ) -> Result<()> {
        let mut grants = self.write()?;
        let grant = owned_grant(&mut grants, owner, model_id)?;
        grant.delegates.insert(delegate.clone());
        info!(%model_id, %delegate, "delegate granted");
        Ok(())
    }

    /// Owner-only: withdraw a delegate. Returns whether it was present.
    pub fn revoke_delegate(
        &self,
        owner: &CallerId,
        model_id: &ModelId,
        delegate: &CallerId,
    ) -> Result<bool> {
        let mut grants = self.write()?;
        let grant = owned_grant(&mut grants, owner, model_id)?;
        let removed = grant.delegates.remove(delegate);
        if removed {
            info!(%model_id, %delegate, "delegate revoked");
        }
        Ok(removed)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ModelId, ModelGrant>>> {
        self.grants
            .write()
            .map_err(|_| MonitorError::StoreUnavailable("acl lock poisoned".into()))
    }
}

fn owned_grant<'a>(
    grants: &'a mut HashMap<ModelId, ModelGrant>,
    owner: &CallerId,
    model_id: &ModelId,
) -> Result<&'a mut ModelGrant> {
    match grants.get_mut(model_id) {
        Some(grant) if &grant.owner == owner => Ok(grant),
        _ => Err(MonitorError::Unauthorized {
            caller: owner.clone(),
            model_id: model_id.clone(),
        }),
    }
}

impl AuthorizationPolicy for ModelAcl {
    fn is_authorized(&self, caller: &CallerId, model_id: &ModelId) -> bool {
        // Fail closed on a poisoned lock.
        let grants = match self.grants.read() {
            Ok(g) => g,
            Err(_) => return false,
        };
        match grants.get(model_id) {
            Some(grant) => &grant.owner == caller || grant.delegates.contains(caller),
            None => self.open_registration,
        }
    }

    fn on_model_registered(&self, caller: &CallerId, model_id: &ModelId) -> Result<()> {
        let mut grants = self.write()?;
        grants.entry(model_id.clone()).or_insert_with(|| {
            debug!(%model_id, owner = %caller, "model claimed by first submitter");
            ModelGrant {
                owner: caller.clone(),
                delegates: BTreeSet::new(),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(s: &str) -> ModelId {
        ModelId::new(s).unwrap()
    }

    #[test]
    fn open_registration_lets_first_submitter_claim() {
        let acl = ModelAcl::new(true);
        let alice = CallerId::new("alice");
        let bob = CallerId::new("bob");
        let m = model("fraud");

        assert!(acl.is_authorized(&alice, &m));
        acl.on_model_registered(&alice, &m).unwrap();
        assert_eq!(acl.owner(&m), Some(alice.clone()));
        assert!(acl.is_authorized(&alice, &m));
        assert!(!acl.is_authorized(&bob, &m));
    }

    #[test]
    fn closed_registration_requires_grant() {
        let acl = ModelAcl::new(false);
        let alice = CallerId::new("alice");
        let m = model("fraud");
        assert!(!acl.is_authorized(&alice, &m));
        acl.grant_owner(&m, &alice).unwrap();
        assert!(acl.is_authorized(&alice, &m));
    }

    #[test]
    fn registration_does_not_overwrite_owner() {
        let acl = ModelAcl::new(true);
        let m = model("fraud");
        acl.grant_owner(&m, &CallerId::new("admin-pick")).unwrap();
        acl.on_model_registered(&CallerId::new("someone"), &m).unwrap();
        assert_eq!(acl.owner(&m), Some(CallerId::new("admin-pick")));
    }

    #[test]
    fn delegates_are_owner_managed() {
        let acl = ModelAcl::new(true);
        let alice = CallerId::new("alice");
        let bob = CallerId::new("bob");
        let mallory = CallerId::new("mallory");
        let m = model("churn");
        acl.on_model_registered(&alice, &m).unwrap();

        assert!(acl.grant_delegate(&mallory, &m, &mallory).is_err());
        acl.grant_delegate(&alice, &m, &bob).unwrap();
        assert!(acl.is_authorized(&bob, &m));
        assert_eq!(acl.delegates(&m), vec![bob.clone()]);

        assert!(acl.revoke_delegate(&alice, &m, &bob).unwrap());
        assert!(!acl.is_authorized(&bob, &m));
        assert!(!acl.revoke_delegate(&alice, &m, &bob).unwrap());
    }

    #[test]
    fn second_owner_grant_conflicts() {
        let acl = ModelAcl::new(false);
        let m = model("x");
        acl.grant_owner(&m, &CallerId::new("a")).unwrap();
        acl.grant_owner(&m, &CallerId::new("a")).unwrap();
        assert!(matches!(
            acl.grant_owner(&m, &CallerId::new("b")),
            Err(MonitorError::Unauthorized { .. })
        ));
    }

    #[test]
    fn poisoned_acl_refuses_registration() {
        let acl = std::sync::Arc::new(ModelAcl::new(true));
        let poisoner = std::sync::Arc::clone(&acl);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.grants.write().unwrap();
            panic!("poison the acl");
        })
        .join();

        let m = model("fraud");
        assert!(matches!(
            acl.on_model_registered(&CallerId::new("alice"), &m),
            Err(MonitorError::StoreUnavailable(_))
        ));
        assert!(!acl.is_authorized(&CallerId::new("alice"), &m));
    }
}
