//! TLS termination before sniffing, and TLS routed as an opaque protocol.

use std::path::PathBuf;
use std::sync::Arc;

use protomux::matching::{any, http1_fast, tls};
use protomux::net::tls::{load_tls_config, with_default_alpn};
use protomux::net::TlsListener;
use protomux::{Multiplexer, Shutdown};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

mod common;

use common::{read_until, wait_until, within};

struct TestCert {
    dir: PathBuf,
    cert_der: CertificateDer<'static>,
}

impl TestCert {
    fn generate(name: &str) -> Self {
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("protomux-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cert.pem"), cert.pem()).unwrap();
        std::fs::write(dir.join("key.pem"), key_pair.serialize_pem()).unwrap();
        Self {
            dir,
            cert_der: cert.der().clone(),
        }
    }

    fn cert_path(&self) -> PathBuf {
        self.dir.join("cert.pem")
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join("key.pem")
    }

    fn connector(&self, alpn: &[&[u8]]) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        TlsConnector::from(Arc::new(config))
    }
}

impl Drop for TestCert {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[tokio::test]
async fn terminated_tls_is_sniffed_as_plaintext() {
    let cert = TestCert::generate("terminate");
    let server_config = load_tls_config(&cert.cert_path(), &cert.key_path()).await.unwrap();

    let mux = Multiplexer::new(&Shutdown::new());
    let http = mux.match_group([http1_fast(&[])]);
    let rest = mux.match_group([any()]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = {
        let mux = mux.clone();
        tokio::spawn(async move { mux.serve(TlsListener::new(listener, with_default_alpn(server_config))).await })
    };
    wait_until("tls listener registered", || mux.listener_addrs() == vec![addr]).await;

    let connector = cert.connector(&[b"http/1.1"]);
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    let request = b"GET /secure HTTP/1.1\r\nHost: localhost\r\n\r\n";
    stream.write_all(request).await.unwrap();
    let mut conn = within(http.accept()).await.unwrap();
    assert_eq!(read_until(&mut conn, b"\r\n\r\n").await, request);

    conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
    assert_eq!(read_until(&mut stream, b"\r\n\r\n").await, b"HTTP/1.1 204 No Content\r\n\r\n");

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut other = cert
        .connector(&[])
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    other.write_all(b"SSH-2.0-client\r\n").await.unwrap();
    let mut conn = within(rest.accept()).await.unwrap();
    assert_eq!(read_until(&mut conn, b"\r\n").await, b"SSH-2.0-client\r\n");
}

#[tokio::test]
async fn tls_matcher_hands_over_intact_client_hello() {
    let cert = TestCert::generate("passthrough");
    let server_config = load_tls_config(&cert.cert_path(), &cert.key_path()).await.unwrap();

    let mux = Multiplexer::new(&Shutdown::new());
    let secure = mux.match_group([tls(&[])]);
    let http = mux.match_group([http1_fast(&[])]);
    let (addr, _server) = common::start_mux(&mux).await;

    let backend = tokio::spawn(async move {
        let conn = secure.accept().await.unwrap();
        let mut tls_stream = TlsAcceptor::from(server_config).accept(conn).await.unwrap();
        let mut buf = [0u8; 4];
        tls_stream.read_exact(&mut buf).await.unwrap();
        tls_stream.write_all(&buf).await.unwrap();
        tls_stream.flush().await.unwrap();
        buf
    });

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = cert
        .connector(&[])
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    within(stream.read_exact(&mut echoed)).await.unwrap();
    assert_eq!(&echoed, b"ping");
    assert_eq!(&within(backend).await.unwrap(), b"ping");

    // Plain HTTP on the same port still reaches its own group.
    let mut plain = TcpStream::connect(addr).await.unwrap();
    plain.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut conn = within(http.accept()).await.unwrap();
    assert_eq!(read_until(&mut conn, b"\r\n\r\n").await, b"GET / HTTP/1.1\r\n\r\n");
}

#[tokio::test]
async fn default_alpn_is_added_once() {
    let cert = TestCert::generate("alpn");
    let config = load_tls_config(&cert.cert_path(), &cert.key_path()).await.unwrap();
    let http11 = config
        .alpn_protocols
        .iter()
        .filter(|p| p.as_slice() == b"http/1.1")
        .count();
    assert_eq!(http11, 1);

    let again = with_default_alpn(Arc::clone(&config));
    assert_eq!(again.alpn_protocols, config.alpn_protocols);
}
