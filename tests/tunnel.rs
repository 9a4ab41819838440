//! End-to-end tests: a `Dialer` talking to an in-process `ProxyServer`.

use std::sync::Arc;
use std::time::Duration;

use data_encoding::BASE64URL;
use futures::future::BoxFuture;
use russh::keys::PrivateKey;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use ssh_proxy::proxy::{
    BoxedStream, Dialer, ErrorKind, ExecState, ProxyDial, ProxyServer, RunningServer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn random_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// Server that accepts `client_key`, plus any extra query parameters.
async fn start_server(client_key: &PrivateKey, extra: &str) -> RunningServer {
    let authorized = client_key.public_key().to_openssh().unwrap();
    let uri = format!(
        "ssh://127.0.0.1:0?authorized_data={}{}",
        BASE64URL.encode(authorized.as_bytes()),
        extra
    );
    ProxyServer::new(&uri).unwrap().bind().await.unwrap()
}

/// Dialer whose connections always land on `server`.
fn dialer_for(server: &RunningServer, key: &PrivateKey) -> Dialer {
    let pem = key.to_openssh(LineEnding::LF).unwrap();
    let uri = format!(
        "ssh://tester@proxy.test:22?identity_data={}",
        BASE64URL.encode(pem.as_bytes())
    );
    let target = server.local_addr();
    let dial: ProxyDial = Arc::new(
        move |_address: String| -> BoxFuture<'static, std::io::Result<BoxedStream>> {
            Box::pin(async move {
                let stream = TcpStream::connect(target).await?;
                Ok(Box::new(stream) as BoxedStream)
            })
        },
    );
    Dialer::with_proxy_dial(&uri, dial).unwrap()
}

mod dial {
    use super::*;

    #[tokio::test]
    async fn test_dial_reaches_target() {
        let key = random_key();
        let server = start_server(&key, "").await;
        let dialer = dialer_for(&server, &key);

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            let mut request = [0u8; 4];
            conn.read_exact(&mut request).await.unwrap();
            conn.write_all(b"pong").await.unwrap();
            request
        });

        let cancel = CancellationToken::new();
        let mut stream = dialer
            .dial(&cancel, "tcp", &target_addr.to_string())
            .await
            .unwrap();
        assert_eq!(stream.remote_addr().address, target_addr.to_string());

        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        tokio::time::timeout(WAIT, stream.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(&peer.await.unwrap(), b"ping");

        stream.close().await.unwrap();
        dialer.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_unknown_key_is_rejected() {
        let allowed = random_key();
        let server = start_server(&allowed, "").await;
        let dialer = dialer_for(&server, &random_key());

        let err = tokio::time::timeout(
            WAIT,
            dialer.dial(&CancellationToken::new(), "tcp", "127.0.0.1:9"),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        dialer.close().await;
        server.close().await;
    }
}

mod password {
    use super::*;

    /// Echo one `n`-byte message back on a fresh local target.
    async fn echo_target(n: usize) -> (String, tokio::task::JoinHandle<()>) {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = target.local_addr().unwrap().to_string();
        let peer = tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            let mut buf = vec![0u8; n];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });
        (address, peer)
    }

    #[tokio::test]
    async fn test_proxy_url_round_trip() {
        let server = ProxyServer::new("ssh://u:p@:0").unwrap().bind().await.unwrap();
        let port = server.local_addr().port();
        assert_eq!(server.proxy_url(), format!("ssh://u:p@0.0.0.0:{}", port));

        let dialer = Dialer::new(server.proxy_url()).unwrap();
        let (target, peer) = echo_target(4).await;
        let mut stream = tokio::time::timeout(
            WAIT,
            dialer.dial(&CancellationToken::new(), "tcp", &target),
        )
        .await
        .unwrap()
        .unwrap();

        stream.write_all(b"echo").await.unwrap();
        let mut reply = [0u8; 4];
        tokio::time::timeout(WAIT, stream.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"echo");
        peer.await.unwrap();

        stream.close().await.unwrap();
        dialer.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let server = ProxyServer::new("ssh://u:p@127.0.0.1:0").unwrap().bind().await.unwrap();
        let uri = format!("ssh://u:wrong@{}", server.local_addr());
        let dialer = Dialer::new(&uri).unwrap();

        let err = tokio::time::timeout(
            WAIT,
            dialer.dial(&CancellationToken::new(), "tcp", "127.0.0.1:9"),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        dialer.close().await;
        server.close().await;
    }
}

mod unix {
    use super::*;

    #[tokio::test]
    async fn test_dial_reaches_socket() {
        let key = random_key();
        let server = start_server(&key, "").await;
        let dialer = dialer_for(&server, &key);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.sock");
        let target = UnixListener::bind(&path).unwrap();
        let peer = tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            let mut request = [0u8; 4];
            conn.read_exact(&mut request).await.unwrap();
            conn.write_all(b"pong").await.unwrap();
        });

        let address = path.display().to_string();
        let mut stream = dialer
            .dial(&CancellationToken::new(), "unix", &address)
            .await
            .unwrap();
        assert_eq!(stream.remote_addr().network, "unix");

        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        tokio::time::timeout(WAIT, stream.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"pong");
        peer.await.unwrap();

        dialer.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_listener_accepts_on_socket() {
        let key = random_key();
        let server = start_server(&key, "").await;
        let dialer = dialer_for(&server, &key);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.sock");
        let address = path.display().to_string();
        let cancel = CancellationToken::new();
        let mut listener = dialer.listen(&cancel, "unix", &address).await.unwrap();
        assert_eq!(listener.local_addr().address, address);

        let peer = tokio::spawn(async move {
            let mut conn = UnixStream::connect(path).await.unwrap();
            conn.write_all(b"hello").await.unwrap();
        });

        let mut conn = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut greeting = [0u8; 5];
        conn.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");
        peer.await.unwrap();

        listener.close().await.unwrap();
        dialer.close().await;
        server.close().await;
    }
}

mod exec {
    use super::*;

    #[tokio::test]
    async fn test_exec_output_and_lifecycle() {
        let key = random_key();
        let server = start_server(&key, "").await;
        let dialer = dialer_for(&server, &key);

        let cancel = CancellationToken::new();
        let mut stream = dialer.exec(&cancel, "printf", &["%s", "ok"]).await.unwrap();

        let mut output = String::new();
        tokio::time::timeout(WAIT, stream.read_to_string(&mut output))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output, "ok");

        tokio::time::timeout(WAIT, stream.closed()).await.unwrap();
        assert_eq!(stream.exec_state(), Some(ExecState::Closed));

        dialer.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_exec_stdin_reaches_command() {
        let key = random_key();
        let server = start_server(&key, "").await;
        let dialer = dialer_for(&server, &key);

        let cancel = CancellationToken::new();
        let mut stream = dialer.exec(&cancel, "cat", &[]).await.unwrap();
        stream.write_all(b"echoed").await.unwrap();

        let mut buf = [0u8; 6];
        tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"echoed");

        tokio::time::timeout(WAIT, stream.close())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stream.exec_state(), Some(ExecState::Closed));

        dialer.close().await;
        server.close().await;
    }
}

mod listen {
    use super::*;

    #[tokio::test]
    async fn test_remote_listener_accepts() {
        let key = random_key();
        let server = start_server(&key, "").await;
        let dialer = dialer_for(&server, &key);

        let cancel = CancellationToken::new();
        let mut listener = dialer.listen(&cancel, "tcp", "127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr().address;
        let port: u16 = bound.rsplit(':').next().unwrap().parse().unwrap();
        assert_ne!(port, 0);

        let peer = tokio::spawn(async move {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            conn.write_all(b"hello").await.unwrap();
            let mut reply = [0u8; 3];
            conn.read_exact(&mut reply).await.unwrap();
            reply
        });

        let mut conn = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut greeting = [0u8; 5];
        conn.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");
        conn.write_all(b"bye").await.unwrap();
        assert_eq!(&peer.await.unwrap(), b"bye");

        listener.close().await.unwrap();
        assert_eq!(
            listener.accept().await.unwrap_err().kind(),
            ErrorKind::Closed
        );

        dialer.close().await;
        server.close().await;
    }
}

mod permissions {
    use super::*;

    const DOCUMENT: &str = r#"{
        "session": {"default": true},
        "exec": {"allows": ["printf '%s' ok"]}
    }"#;

    #[tokio::test]
    async fn test_permission_document_gates_requests() {
        let home = tempfile::tempdir().unwrap();
        let ssh_dir = home.path().join("tester").join(".ssh");
        std::fs::create_dir_all(&ssh_dir).unwrap();
        std::fs::write(ssh_dir.join("permissions.json"), DOCUMENT).unwrap();

        let key = random_key();
        let extra = format!(
            "&home_dir={}&permissions_file_name=permissions.json",
            home.path().display()
        );
        let server = start_server(&key, &extra).await;
        let dialer = dialer_for(&server, &key);
        let cancel = CancellationToken::new();

        // No rule for direct-tcpip
        let err = dialer.dial(&cancel, "tcp", "127.0.0.1:9").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let err = dialer
            .exec(&cancel, "printf", &["%s", "no"])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let mut stream = dialer.exec(&cancel, "printf", &["%s", "ok"]).await.unwrap();
        let mut output = String::new();
        tokio::time::timeout(WAIT, stream.read_to_string(&mut output))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output, "ok");

        dialer.close().await;
        server.close().await;
    }
}
