// Addressing policy.
//
// `route` decides who receives an envelope, given the sender, the target,
// and the ids in a registry snapshot. It is a pure function so both channels
// (and the tests) share exactly one definition of the addressing rules:
//
// - `Target::Broadcast` → every registered id except the sender.
// - `Target::Server` → consumed locally, never forwarded.
// - `Target::Client(HOST)` → also local; id 1 is the host's ordinary
//   identity and the host is not a registry entry.
// - `Target::Client(id)` → that id if registered, otherwise `NotFound`.

use crate::types::{ClientId, Target};

/// Delivery decision for one envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Handled by the receiving process only.
    Local,
    /// Forward to each of these ids.
    Broadcast(Vec<ClientId>),
    /// Forward to exactly this id.
    Unicast(ClientId),
    /// The unicast target is not registered.
    NotFound(ClientId),
}

impl Route {
    /// Ids the envelope should be forwarded to.
    pub fn recipients(&self) -> &[ClientId] {
        match self {
            Route::Broadcast(ids) => ids,
            Route::Unicast(id) => std::slice::from_ref(id),
            Route::Local | Route::NotFound(_) => &[],
        }
    }
}

/// Resolve `target` against the registered ids.
pub fn route<I>(sender: ClientId, target: Target, registered: I) -> Route
where
    I: IntoIterator<Item = ClientId>,
{
    match target {
        Target::Server => Route::Local,
        Target::Client(id) if id.is_host() => Route::Local,
        Target::Broadcast => Route::Broadcast(
            registered
                .into_iter()
                .filter(|id| *id != sender)
                .collect(),
        ),
        Target::Client(id) => {
            if registered.into_iter().any(|registered_id| registered_id == id) {
                Route::Unicast(id)
            } else {
                Route::NotFound(id)
            }
        }
    }
}
