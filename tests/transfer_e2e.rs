use anyhow::Result;
use lanshare::client::Client;
use lanshare::config::{ClientConfig, ServerConfig};
use lanshare::error::ClientError;
use lanshare::protocol::{EMPTY_LISTING, FILE_CHUNK_SIZE};
use lanshare::server::FileServer;
use std::net::Ipv4Addr;
use std::path::Path;

fn write_file(path: &Path, size: usize) -> Result<Vec<u8>> {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(path, &data)?;
    Ok(data)
}

// Start a server on an ephemeral loopback port, returning the port
async fn start_server(root: &Path) -> Result<u16> {
    let config = ServerConfig::new(root)
        .bind_ip(Some(Ipv4Addr::LOCALHOST))
        .port(0)
        .max_connections(8);
    let server = FileServer::bind(&config)?;
    let port = server.local_addr()?.port();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    Ok(port)
}

async fn list(port: u16) -> Result<String, ClientError> {
    tokio::task::spawn_blocking(move || {
        Client::new(ClientConfig::default().port(port)).list("127.0.0.1")
    })
    .await
    .expect("client task panicked")
}

async fn get(port: u16, dest: &Path, name: &str) -> Result<lanshare::client::Download, ClientError> {
    let dest = dest.to_path_buf();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || {
        Client::new(ClientConfig::default().port(port).download_dir(&dest)).get("127.0.0.1", &name)
    })
    .await
    .expect("client task panicked")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downloads_are_byte_identical() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;

    let sizes = [
        0,
        1,
        FILE_CHUNK_SIZE - 1,
        FILE_CHUNK_SIZE,
        FILE_CHUNK_SIZE + 1,
        3 * 1024 * 1024,
    ];
    let mut expected = Vec::new();
    for size in sizes {
        let name = format!("file_{}.bin", size);
        expected.push((name.clone(), write_file(&srv.path().join(&name), size)?));
    }

    let port = start_server(srv.path()).await?;
    for (name, data) in expected {
        let download = get(port, dst.path(), &name).await?;
        assert_eq!(download.bytes, data.len() as u64, "{}", name);
        assert_eq!(download.path, dst.path().join(&name));
        assert_eq!(std::fs::read(&download.path)?, data, "{}", name);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listing_matches_directory() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let port = start_server(srv.path()).await?;
    assert_eq!(list(port).await?, EMPTY_LISTING);

    std::fs::write(srv.path().join("b.txt"), "b")?;
    std::fs::write(srv.path().join("a.txt"), "a")?;
    std::fs::write(srv.path().join(".secret"), "s")?;
    std::fs::create_dir(srv.path().join("nested"))?;

    let listing = list(port).await?;
    assert_eq!(listing, "a.txt\nb.txt");
    assert!(!listing.ends_with('\n'));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_file_leaves_nothing_behind() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let dst = tempfile::tempdir()?;
    let port = start_server(srv.path()).await?;

    let err = get(port, dst.path(), "missing.txt").await.unwrap_err();
    match err {
        ClientError::Server(text) => assert_eq!(text, "File not found or cannot be accessed"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!dst.path().join("missing.txt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn traversal_is_refused() -> Result<()> {
    let outer = tempfile::tempdir()?;
    let srv = outer.path().join("share");
    std::fs::create_dir(&srv)?;
    std::fs::write(outer.path().join("secret.txt"), "do not serve")?;
    let dst = tempfile::tempdir()?;
    let port = start_server(&srv).await?;

    let err = get(port, dst.path(), "../secret.txt").await.unwrap_err();
    match err {
        ClientError::Server(text) => assert_eq!(text, "Invalid filename"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!dst.path().join("secret.txt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_do_not_interfere() -> Result<()> {
    let srv = tempfile::tempdir()?;
    let one = write_file(&srv.path().join("one.bin"), 512 * 1024)?;
    let two = write_file(&srv.path().join("two.bin"), 300 * 1024 + 7)?;
    let port = start_server(srv.path()).await?;

    let mut tasks = Vec::new();
    for i in 0..6 {
        let dst = tempfile::tempdir()?;
        let name = if i % 2 == 0 { "one.bin" } else { "two.bin" };
        tasks.push(tokio::spawn(async move {
            let download = get(port, dst.path(), name).await.expect("download");
            let bytes = std::fs::read(&download.path).expect("read back");
            (name, bytes, dst)
        }));
    }
    let listing = tokio::spawn(list(port));

    for task in tasks {
        let (name, bytes, _dst) = task.await?;
        let expected = if name == "one.bin" { &one } else { &two };
        assert_eq!(&bytes, expected, "{}", name);
    }
    assert_eq!(listing.await??, "one.bin\ntwo.bin");
    Ok(())
}
