//! Helpers for reading single messages off framed streams.

use futures::{TryStream, TryStreamExt};

/// The error reported when the remote closes a stream mid-exchange.
pub fn connection_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed")
}

/// Read exactly one message from a framed stream.
///
/// A stream that ends before yielding a message is reported as
/// [`std::io::ErrorKind::UnexpectedEof`].
pub async fn next_message<S, T, E>(framed: &mut S) -> Result<T, E>
where
    S: TryStream<Ok = T, Error = E> + Unpin,
    E: From<std::io::Error>,
{
    match framed.try_next().await? {
        Some(message) => Ok(message),
        None => Err(connection_closed().into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::{executor::block_on, stream};

    #[test]
    fn test_next_message_yields_first_item() {
        let mut items = stream::iter(vec![Ok::<_, std::io::Error>(1u8), Ok(2)]);
        let first: u8 = block_on(next_message(&mut items)).unwrap();
        assert_eq!(first, 1);
        let second: u8 = block_on(next_message(&mut items)).unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn test_next_message_on_empty_stream() {
        let mut items = stream::iter(Vec::<Result<u8, std::io::Error>>::new());
        let err = block_on(next_message(&mut items)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_next_message_propagates_error() {
        let mut items = stream::iter(vec![Err::<u8, _>(std::io::Error::other("boom"))]);
        let err = block_on(next_message(&mut items)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
    }
}
