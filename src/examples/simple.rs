//! Simple example of tunneling through an HTTP proxy.

use tunnel_agent::{connect, https_agent, ConnectOptions, Destination};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Proxy URL format: http://[user:pass@]host[:port]
    let options = ConnectOptions::new("example.com", 443, "http://127.0.0.1:3128");

    println!("Requesting cached agent...");
    let agent = https_agent(&options)?;

    let dest = Destination::from(&options);
    println!("Obtaining tunnel socket to {dest}...");
    let socket = agent.obtain(&dest).await?;
    println!("Tunnel established: {:?}", socket.peer_addr()?);

    // Hand the socket back so the next request through this proxy reuses it.
    agent.release(&dest, socket);
    println!("Pool stats: {:?}", agent.stats());

    // One-shot tunnel without pooling.
    let pending = connect(&options, |socket| {
        println!("One-shot tunnel socket: {:?}", socket.peer_addr());
    })?;
    pending.outcome().await?;

    Ok(())
}
