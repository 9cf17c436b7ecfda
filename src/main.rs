use futures::future::BoxFuture;
use h3_wt::transport::memory::{self, MemoryEndpoint};
use h3_wt::webtransport::SessionHandler;
use h3_wt::{
    ClientConfig, H3Client, H3Request, H3Response, H3Result, H3Server, ServerConfig, Session,
    WebTransportClient, WebTransportServer,
};
use std::time::Duration;

/// Echoes every bidirectional stream of a session back to its sender.
struct Echo;

impl SessionHandler for Echo {
    fn accept(&self, session: Session) -> BoxFuture<'_, H3Result<()>> {
        Box::pin(async move {
            session.set_bidirectional_stream_handler(|mut stream| {
                tokio::spawn(async move {
                    let (Ok(mut reader), Ok(mut writer)) = (stream.take_reader(), stream.take_writer()) else {
                        return;
                    };
                    while let Ok(Some(chunk)) = reader.read_chunk(16 * 1024).await {
                        if writer.write_all(&chunk).await.is_err() {
                            return;
                        }
                    }
                    let _ = writer.finish().await;
                });
            });
            Ok(())
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("h3-wt demo over an in-memory QUIC pair");

    let (client_end, server_end) = memory::pair();
    let MemoryEndpoint { connection, incoming } = server_end;
    let server = H3Server::new(
        connection,
        ServerConfig::default(),
        h3_wt::server::handler(|request: h3_wt::ServerRequest| async move {
            Ok::<_, h3_wt::H3Error>(H3Response::ok()
                .with_header("content-type", "text/plain")
                .with_body(format!("hello from {}", request.path_only())))
        }),
    )?;
    let webtransport = WebTransportServer::new(&server)?;
    webtransport.register_path("/echo", Echo);
    server.start().await?;
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(incoming).await });

    let config = ClientConfig::builder()
        .settings_timeout(Duration::from_secs(5))
        .build();
    let MemoryEndpoint { connection, incoming } = client_end;
    let client = H3Client::connect(connection, config).await?;
    let serving = client.clone();
    tokio::spawn(async move { serving.serve(incoming).await });

    let request = H3Request::get("https://localhost/greeting")
        .header("accept", "text/plain")
        .user_agent("h3-wt-demo/0.1")
        .build()?;
    println!("Sending request: {} {}", request.method, request.uri);
    let response = client.send_request(request).await?;
    println!("Received response: {}", response.status);
    println!("Response body: {}", String::from_utf8_lossy(&response.body.to_bytes().await?));

    let wt = WebTransportClient::new(client.clone())?;
    let session = wt.connect("localhost", "/echo").await?;
    let mut stream = session.create_bidirectional_stream().await?;
    let mut writer = stream.take_writer()?;
    writer.write_all(b"ping").await?;
    writer.finish().await?;
    let mut reader = stream.take_reader()?;
    let mut echoed = Vec::new();
    while let Some(chunk) = reader.read_chunk(1024).await? {
        echoed.extend_from_slice(&chunk);
    }
    println!("WebTransport echo: {}", String::from_utf8_lossy(&echoed));

    session.close(0, "bye").await?;
    server.shutdown().await?;
    client.close();

    println!("Demo completed successfully!");

    Ok(())
}
