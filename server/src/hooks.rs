use shared::session::versions_compatible;
use shared::{Message, WorldStore};

/// Game-specific callbacks invoked from the tick thread. Every method has a
/// default, so a server that only replicates state can use [`NoHooks`].
pub trait ServerHooks<W: WorldStore> {
    /// Accepts or rejects credentials for a LOGIN.
    fn validate_login(&mut self, _name: &str, _credentials: &str) -> bool {
        true
    }

    fn version_compatible(&self, ours: &str, theirs: &str) -> bool {
        versions_compatible(ours, theirs)
    }

    /// Called after a new player has been synchronized and announced.
    fn player_joined(&mut self, _world: &mut W, _player_id: u16) {}

    /// Called once a dropped player's record has been removed for good.
    fn player_left(&mut self, _world: &mut W, _player_id: u16) {}

    /// Messages with tags the session layer does not own. Return false to
    /// have the message logged and ignored.
    fn game_message(&mut self, _world: &mut W, _player_id: u16, _msg: &mut Message) -> bool {
        false
    }
}

/// Hooks that accept every login and ignore game messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<W: WorldStore> ServerHooks<W> for NoHooks {}
