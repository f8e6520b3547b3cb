use ai_gateway_transcoder::{config::Config, telemetry, Error, Result, Transcoder};
use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};

const USAGE: &str = "usage: sse-transcode <source-protocol> <destination-protocol> [session-id]";

/// 从 stdin 读取上游 SSE，转码后写到 stdout
///
/// ```text
/// curl -N ... | sse-transcode openai anthropic
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::from_file("config.yaml").unwrap_or_else(|_| Config::default());
    telemetry::init_logging(&config.logging);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        return Err(Error::InvalidRequest(USAGE.to_string()));
    }

    let transcoder = Transcoder::new(config.transcoder.clone());
    let source = transcoder.resolve_protocol(args.first().map(String::as_str))?;
    let destination = transcoder.resolve_protocol(args.get(1).map(String::as_str))?;
    let session_id = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

    info!(%source, %destination, %session_id, "transcoding stdin");

    let input = stream! {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 8192];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    yield Err(Error::from(e));
                    break;
                }
            }
        }
    };

    let mut output = transcoder.transcode_sse(source, destination, &session_id, input)?;
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = output.next().await {
        match frame {
            Ok(bytes) => {
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
            Err(e) => {
                error!(error = %e, "transcoding aborted");
                return Err(e);
            }
        }
    }

    Ok(())
}
