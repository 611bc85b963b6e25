//! Echo server driven entirely by the watcher: every accepted connection
//! gets a pending read, and each completed read is echoed back before the
//! next read is armed.

use std::net::TcpListener;
use std::sync::Arc;

use edgeio::{OpKind, RawStream, Watcher};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let listener = TcpListener::bind(&addr)?;
    eprintln!("listening on {addr}");

    let watcher = Arc::new(Watcher::new(64 * 1024)?);

    {
        let watcher = watcher.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let conn: Arc<dyn RawStream> = Arc::new(stream);
                if watcher.read(0, &conn, None).is_err() {
                    break;
                }
            }
        });
    }

    loop {
        let batch = match watcher.wait_io() {
            Ok(batch) => batch,
            Err(_) => break,
        };
        for result in batch {
            if result.err.is_some() || (result.op == OpKind::Read && result.size == 0) {
                // Transfer error or peer EOF; the watcher already released
                // the descriptor.
                continue;
            }
            if result.op == OpKind::Read {
                watcher.write(0, &result.conn, result.buffer.clone())?;
                watcher.read(0, &result.conn, None)?;
            }
        }
    }
    Ok(())
}
