use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use geochat::protocol::{Message, Position};

// ─── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "client", about = "geochat line client")]
struct Args {
    #[arg(long, env = "GEOCHAT_ADDR", default_value = "localhost:8080")]
    addr: String,

    #[arg(long)]
    email: String,

    #[arg(long)]
    username: String,

    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true, value_parser = parse_coord)]
    lon: f64,

    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true, value_parser = parse_coord)]
    lat: f64,

    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true, value_parser = parse_coord)]
    alt: f64,

    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true, value_parser = parse_coord)]
    heading: f64,
}

// ─── Input parsing ────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Command {
    Say(String),
    Move(Position),
    Quit,
}

/// Finite numbers only; NaN and infinities cannot be encoded.
fn parse_coord(s: &str) -> std::result::Result<f64, String> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(_) => Err(format!("coordinate must be finite: {s}")),
        Err(_) => Err(format!("not a number: {s}")),
    }
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if line == "/quit" {
        return Ok(Some(Command::Quit));
    }
    if let Some(rest) = line.strip_prefix("/pos") {
        let nums = rest
            .split_whitespace()
            .map(|s| parse_coord(s).map_err(anyhow::Error::msg))
            .collect::<Result<Vec<_>>>()?;
        let [lon, lat, alt, heading] = nums[..] else {
            bail!("usage: /pos <lon> <lat> <alt> <heading>");
        };
        return Ok(Some(Command::Move(Position::new(lon, lat, alt, heading))));
    }
    Ok(Some(Command::Say(line.to_string())))
}

fn render(msg: &Message) -> String {
    let p = &msg.position;
    format!(
        "[{} @ {:.5},{:.5} alt {:.1} hdg {:.0}] {}",
        msg.username, p.latitude, p.longitude, p.altitude, p.heading, msg.message
    )
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("connecting to {}", args.addr))?;
    let (reader, writer) = stream.into_split();

    // Channel: stdin → server writer
    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(64);

    // Reader task: print every broadcast until the server hangs up
    let mut reader_task = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match Message::decode(line.as_bytes()) {
                Ok(msg) => println!("{}", render(&msg)),
                Err(e) => eprintln!("! {e}"),
            }
        }
        eprintln!("! disconnected");
    });

    // Writer task
    tokio::spawn(async move {
        let mut w = writer;
        while let Some(data) = write_rx.recv().await {
            if w.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let mut position = Position::new(args.lon, args.lat, args.alt, args.heading);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = stdin.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = &mut reader_task => break,
        };

        let cmd = match parse_command(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("! {e}");
                continue;
            }
        };

        let body = match cmd {
            Command::Quit => break,
            Command::Move(p) => {
                position = p;
                String::new()
            }
            Command::Say(text) => text,
        };

        let msg = Message::new(&args.email, &args.username, body, position);
        let mut data = msg.encode()?.to_vec();
        data.push(b'\n');
        if write_tx.send(data).await.is_err() {
            break;
        }
    }

    Ok(())
}
