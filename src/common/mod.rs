pub(crate) mod io;

use std::future::Future;
use std::pin::Pin;

/// Boxed future used at collaborator trait boundaries.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
