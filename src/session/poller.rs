use std::cmp;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::trace;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{timeout, Instant};

const TCP_INIT_TIMEOUT_MS: u16 = 1000;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Open a TCP connection to a peer, sourced from the listen address when it's specific
pub async fn connect(peer_addr: SocketAddr, source: IpAddr) -> Result<TcpStream, io::Error> {
    let socket = match peer_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    if !source.is_unspecified() && source.is_ipv4() == peer_addr.is_ipv4() {
        socket.bind(SocketAddr::new(source, 0))?;
    }
    trace!("Connecting to {}", peer_addr);
    match timeout(
        Duration::from_millis(TCP_INIT_TIMEOUT_MS.into()),
        socket.connect(peer_addr),
    )
    .await
    {
        Ok(connected) => connected,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("Connection to {} timed out", peer_addr),
        )),
    }
}

/// Outbound connection retry budget: delays double from 1 second,
/// bounded by both an attempt count and total elapsed time
#[derive(Debug)]
pub struct ConnectRetry {
    attempts: u32,
    max_attempts: u32,
    max_time: Duration,
    started: Instant,
    next_delay: Duration,
}

impl ConnectRetry {
    pub fn new(max_attempts: u32, max_time: Duration, started: Instant) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            max_time,
            started,
            next_delay: INITIAL_RETRY_DELAY,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, None once the budget is spent
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.max_time {
            return None;
        }
        let delay = cmp::min(self.next_delay, self.max_time - elapsed);
        self.attempts += 1;
        self.next_delay = self.next_delay * 2;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_backoff_by_count() {
        let start = Instant::now();
        let mut retry = ConnectRetry::new(4, Duration::from_secs(600), start);
        let delays: Vec<_> = std::iter::from_fn(|| retry.next_delay(start)).collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>()
        );
        assert_eq!(retry.attempts(), 4);
    }

    #[test]
    fn test_backoff_by_time() {
        let start = Instant::now();
        let mut retry = ConnectRetry::new(10, Duration::from_secs(5), start);
        assert_eq!(retry.next_delay(start), Some(Duration::from_secs(1)));
        assert_eq!(retry.next_delay(start + Duration::from_secs(1)), Some(Duration::from_secs(2)));
        // Only 2 seconds of budget left
        assert_eq!(retry.next_delay(start + Duration::from_secs(3)), Some(Duration::from_secs(2)));
        assert_eq!(retry.next_delay(start + Duration::from_secs(5)), None);
    }

    #[tokio::test]
    async fn test_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(
            connect(addr, "127.0.0.1".parse().unwrap()),
            listener.accept()
        );
        let stream = connected.unwrap();
        let (_, remote) = accepted.unwrap();
        assert_eq!(stream.local_addr().unwrap(), remote);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then close it
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        assert!(connect(addr, "0.0.0.0".parse().unwrap()).await.is_err());
    }
}
