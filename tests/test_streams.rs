//! Tests for the buffered stream adapters, the limited reader and pipe.

use palisade::io::{pipe, AsyncBufRead, AsyncRead, AsyncWrite, BufReader, BufWriter, LimitedReader};
use palisade::runtime::Runtime;

fn run<T: Send + 'static>(future: impl std::future::Future<Output = T> + Send + 'static) -> T {
    Runtime::sequential().unwrap().block_on(future)
}

#[test]
fn test_buf_reader_fill_and_consume() {
    run(async {
        let data: &[u8] = b"hello world";
        let mut reader = BufReader::new(data, 4);

        let chunk = reader.fill_buf().await.unwrap();
        assert_eq!(chunk, b"hell");
        reader.consume(2);

        let chunk = reader.fill_buf().await.unwrap();
        assert_eq!(chunk, b"ll");
        reader.consume(2);

        let chunk = reader.fill_buf().await.unwrap();
        assert_eq!(chunk, b"o wo");
    });
}

#[test]
fn test_buf_reader_eof_is_empty_slice() {
    run(async {
        let data: &[u8] = b"ab";
        let mut reader = BufReader::new(data, 8);
        reader.consume(0);
        let chunk = reader.fill_buf().await.unwrap();
        assert_eq!(chunk, b"ab");
        reader.consume(2);
        let chunk = reader.fill_buf().await.unwrap();
        assert!(chunk.is_empty());
    });
}

#[test]
fn test_buf_writer_buffers_until_flush() {
    run(async {
        let mut writer = BufWriter::new(Vec::new(), 16);
        writer.write_all(b"abc").await.unwrap();
        writer.write_all(b"def").await.unwrap();
        writer.flush().await.unwrap();
        let sink = writer.into_inner().await.unwrap();
        assert_eq!(sink, b"abcdef");
    });
}

#[test]
fn test_buf_writer_flushes_when_full() {
    run(async {
        let mut writer = BufWriter::new(Vec::new(), 4);
        writer.write_all(b"abcd").await.unwrap();
        writer.write_all(b"e").await.unwrap();
        // The first four bytes no longer fit alongside the fifth.
        let sink = writer.into_inner().await.unwrap();
        assert_eq!(sink, b"abcde");
    });
}

#[test]
fn test_limited_reader_zero_budget_is_immediate_eof() {
    run(async {
        let data: &[u8] = b"plenty of bytes";
        let mut limited = LimitedReader::new(data, 0);
        let mut buf = [0u8; 8];
        assert_eq!(limited.read(&mut buf).await.unwrap(), 0);
    });
}

#[test]
fn test_limited_reader_stops_at_budget() {
    run(async {
        let data: &[u8] = b"0123456789";
        let mut limited = LimitedReader::new(data, 4);
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = limited.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"0123");
        assert_eq!(limited.remaining(), 0);
    });
}

#[test]
fn test_limited_reader_caps_fill_buf() {
    run(async {
        let data: &[u8] = b"0123456789";
        let mut limited = LimitedReader::new(BufReader::new(data, 32), 4);
        let chunk = limited.fill_buf().await.unwrap();
        assert_eq!(chunk, b"0123");
        limited.consume(4);
        let chunk = limited.fill_buf().await.unwrap();
        assert!(chunk.is_empty());
    });
}

#[test]
fn test_pipe_copies_everything() {
    run(async {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut reader = BufReader::new(payload.as_slice(), 64);
        let mut sink = Vec::new();
        let copied = pipe(&mut reader, &mut sink).await.unwrap();
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(sink, payload);
    });
}

#[test]
fn test_pipe_through_buf_writer_flushes() {
    run(async {
        let payload = b"small body".to_vec();
        let mut reader = BufReader::new(payload.as_slice(), 8);
        let mut writer = BufWriter::new(Vec::new(), 1024);
        pipe(&mut reader, &mut writer).await.unwrap();
        // pipe's final flush must push the tail out of the buffer.
        let sink = writer.into_inner().await.unwrap();
        assert_eq!(sink, payload);
    });
}

#[test]
fn test_pipe_empty_reader() {
    run(async {
        let data: &[u8] = b"";
        let mut reader = BufReader::new(data, 16);
        let mut sink = Vec::new();
        assert_eq!(pipe(&mut reader, &mut sink).await.unwrap(), 0);
        assert!(sink.is_empty());
    });
}
