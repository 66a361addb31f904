//! Core traits for Courier.
//!
//! These traits define the boundary between the engine and the host
//! application.

use crate::buffer::Message;
use crate::session::Session;

/// Receiver of socket events.
///
/// Registered once per socket with
/// [`Socket::set_listener`](crate::socket::Socket::set_listener). Every
/// method runs synchronously on the socket's loop, so implementations must
/// not block.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl SocketListener for Echo {
///     fn on_connected(&mut self, session: &mut Session<'_>) {
///         tracing::info!(session = %session.id(), "connected");
///     }
///
///     fn on_disconnected(&mut self, session: &mut Session<'_>) {
///         tracing::info!(session = %session.id(), "disconnected");
///     }
///
///     fn on_received(&mut self, session: &mut Session<'_>, message: &mut Message) {
///         let mut reply = Message::new();
///         let _ = reply.write(message.read_remaining().unwrap_or_default());
///         session.send(0, &reply);
///     }
/// }
/// ```
pub trait SocketListener {
    /// A session was established.
    fn on_connected(&mut self, session: &mut Session<'_>);

    /// A session ended. Sends on `session` return 0 from here on; its ID,
    /// client ID and user data are still readable.
    fn on_disconnected(&mut self, session: &mut Session<'_>);

    /// A message arrived. The message is only valid for this call.
    fn on_received(&mut self, session: &mut Session<'_>, message: &mut Message);
}
