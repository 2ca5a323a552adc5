//! The gateway contract: the server's sole upcall surface.

use std::fmt;

use crate::server::request::Request;

/// An application-supplied request responder.
///
/// The server calls [`respond`] once per parsed request, strictly in
/// request order per connection. The implementation reads the (bounded)
/// request body through the [`Request`] body methods, sets the status and
/// outbound headers, and emits body bytes via [`Request::write`]. It must
/// never touch the socket directly and must finish the response before
/// returning.
///
/// Gateways are shared across all worker threads, so `respond` must be
/// re-entrant.
///
/// Any plain function or closure with the right signature is a gateway:
///
/// ```
/// use hearth::Request;
///
/// fn hello(req: &mut Request<'_>) -> hearth::Result<()> {
///     req.set_status(200)?;
///     req.write(b"hello")
/// }
/// ```
///
/// [`respond`]: Gateway::respond
pub trait Gateway: Send + Sync + 'static {
    /// Produces the response for one request.
    fn respond(&self, req: &mut Request<'_>) -> crate::Result<()>;
}

impl<F> Gateway for F
where
    F: Fn(&mut Request<'_>) -> crate::Result<()> + Send + Sync + 'static,
{
    fn respond(&self, req: &mut Request<'_>) -> crate::Result<()> {
        (self)(req)
    }
}

impl fmt::Debug for dyn Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Gateway")
    }
}
