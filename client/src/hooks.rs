use shared::{Message, SessionState, WorldStore};

/// Game-specific reactions to session events on the client.
pub trait ClientHooks<W: WorldStore> {
    fn logged_in(&mut self, _world: &mut W, _player_id: u16) {}

    fn state_changed(&mut self, _state: SessionState) {}

    fn player_added(&mut self, _world: &mut W, _player_id: u16) {}

    fn player_removed(&mut self, _world: &mut W, _player_id: u16) {}

    /// The server closed the session with `reason`.
    fn disconnected(&mut self, _reason: &str) {}

    /// Messages with tags the session layer does not own. Return false to
    /// have the message logged and ignored.
    fn game_message(&mut self, _world: &mut W, _msg: &mut Message) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<W: WorldStore> ClientHooks<W> for NoHooks {}
