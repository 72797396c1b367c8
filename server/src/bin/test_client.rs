use clap::Parser;
use shared::codec::{frame, zlib_compress, Codec, Encoder, Generation};
use shared::frame::FrameBuffer;
use shared::gstring::GWrite;
use shared::opcodes::{PLI_PLAYERPROPS, PLI_TOALL};
use shared::packet;
use shared::props::{PLPROP_CURCHAT, PLPROP_X, PLPROP_Y};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const CLIENT3_TYPE: u8 = 5;
const KEY: u8 = 42;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    #[clap(short, long, default_value = "14900")]
    port: u16,
    #[clap(short, long, default_value = "testclient")]
    account: String,
    /// Movement steps to send before disconnecting
    #[clap(short, long, default_value = "10")]
    steps: u32,
}

fn login_frame(account: &str) -> Vec<u8> {
    let mut record = Vec::new();
    record.write_gchar(CLIENT3_TYPE).write_gchar(KEY);
    record.write_bytes(b"G3D22067");
    record.write_gchar(account.len() as u8).write_bytes(account.as_bytes());
    record.write_gchar(4).write_bytes(b"test");
    record.push(b'\n');
    frame(&zlib_compress(&record))
}

// Joins records into one encrypted frame
fn records_frame(encoder: &mut Encoder, records: &[Vec<u8>]) -> Vec<u8> {
    let mut plain = Vec::new();
    for r in records {
        plain.extend_from_slice(r);
        plain.push(b'\n');
    }
    frame(&encoder.encode_frame(&plain))
}

// Prints every record of whatever arrives within the wait
async fn drain(stream: &mut TcpStream, codec: &mut Codec, buffer: &mut FrameBuffer, wait: Duration) {
    let mut chunk = [0u8; 8192];
    while let Ok(Ok(len)) = timeout(wait, stream.read(&mut chunk)).await {
        if len == 0 {
            println!("Server closed the connection");
            return;
        }
        buffer.push(&chunk[..len]);
        while let Some(body) = buffer.next_frame() {
            let plain = codec.decode_frame(&body);
            for record in plain.split(|&b| b == b'\n').filter(|r| !r.is_empty()) {
                println!(
                    "  opcode {:3} ({} bytes)",
                    record[0].wrapping_sub(32),
                    record.len()
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let address = format!("{}:{}", args.host, args.port);
    let mut stream = TcpStream::connect(&address).await?;
    println!("Connected to {}", address);

    stream.write_all(&login_frame(&args.account)).await?;
    println!("Sent login for {}", args.account);

    let mut codec = Codec::new();
    codec.set_generation(Generation::Gen5);
    codec.reset(KEY);
    let mut encoder = Encoder::new(Generation::Gen5, KEY);
    let mut buffer = FrameBuffer::new();

    println!("Waiting for server response...");
    drain(&mut stream, &mut codec, &mut buffer, Duration::from_secs(2)).await;

    let message = b"hello from the test client";
    let mut chat = packet(PLI_TOALL);
    chat.write_gchar(message.len() as u8).write_bytes(message);

    for step in 0..args.steps {
        let mut props = packet(PLI_PLAYERPROPS);
        props
            .write_gchar(PLPROP_X)
            .write_gchar(((30 + step % 8) * 2) as u8)
            .write_gchar(PLPROP_Y)
            .write_gchar(60);
        let mut records = vec![props];
        if step == 0 {
            let mut says = packet(PLI_PLAYERPROPS);
            says.write_gchar(PLPROP_CURCHAT).write_gchar(5).write_bytes(b"hello");
            records.push(says);
            records.push(chat.clone());
        }
        println!("Sending step {}", step);
        stream.write_all(&records_frame(&mut encoder, &records)).await?;
        drain(&mut stream, &mut codec, &mut buffer, Duration::from_millis(200)).await;
        sleep(Duration::from_millis(300)).await;
    }

    stream.shutdown().await?;
    println!("Test client finished");
    Ok(())
}
