//! Development client: joins, optionally fires one shot and prints what the
//! server sends.

use clap::Parser;
use log::info;
use server::dev_client::DevClient;
use shared::{ClientMessage, ServerFrame};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:4443")]
    server: SocketAddr,

    /// Name expected on the server certificate
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Player name to join with
    #[arg(short, long)]
    player: Option<String>,

    /// Token sent before joining
    #[arg(long)]
    token: Option<String>,

    /// Fire one bullet to the right after joining
    #[arg(long)]
    shoot: bool,

    /// How long to keep printing messages, in seconds
    #[arg(short, long, default_value = "5")]
    duration: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut client = DevClient::connect(args.server, &args.server_name).await?;
    info!("Connected to {} from {}", args.server, client.local_addr()?);

    if let Some(token) = args.token {
        client.send(&ClientMessage::Auth { token }).await?;
    }
    client
        .send(&ClientMessage::Join {
            player: args.player.clone(),
        })
        .await?;

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut shot = !args.shoot;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(frame) = client.next_frame(remaining).await? else {
            break;
        };

        match &frame {
            ServerFrame::Message(message) => println!("<- {:?}", message),
            ServerFrame::Snapshot(snapshot) => println!(
                "<- snapshot: {} players, {} items, {} bullets",
                snapshot.players.len(),
                snapshot.items.len(),
                snapshot.bullets.len()
            ),
        }

        // Shoot from our own position once the first snapshot shows it.
        if !shot {
            if let (ServerFrame::Snapshot(snapshot), Some(name)) = (&frame, &args.player) {
                if let Some(me) = snapshot.players.iter().find(|p| &p.name == name) {
                    client
                        .send(&ClientMessage::Shoot {
                            x: me.x as i64,
                            y: me.y as i64,
                            dx: 1.0,
                            dy: 0.0,
                            player: name.clone(),
                        })
                        .await?;
                    shot = true;
                }
            }
        }
    }

    client.close().await;
    Ok(())
}
