//! Property tests for cache rectangle framing.
//!
//! These tests verify that cache message parsing is robust against
//! fragmentation at arbitrary byte boundaries, which is critical for correct
//! operation over real network streams.

#[cfg(test)]
mod tests {
    use super::super::cache::*;
    use super::super::types::*;
    use crate::io::{RfbInStream, RfbOutStream};
    use proptest::prelude::*;

    /// A fragmenting reader that splits reads at a specific boundary.
    ///
    /// This simulates network fragmentation by only allowing reads up to
    /// a specific position, then requiring a second read for the rest.
    struct FragmentingReader {
        data: Vec<u8>,
        pos: usize,
        boundary: usize,
    }

    impl FragmentingReader {
        fn new(data: Vec<u8>, boundary: usize) -> Self {
            let boundary = boundary.min(data.len());
            Self {
                data,
                pos: 0,
                boundary,
            }
        }
    }

    impl tokio::io::AsyncRead for FragmentingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.pos >= self.data.len() {
                return std::task::Poll::Ready(Ok(()));
            }

            // Only read up to boundary on first pass, or remaining data after
            let available = if self.pos < self.boundary {
                (self.boundary - self.pos).min(buf.remaining())
            } else {
                (self.data.len() - self.pos).min(buf.remaining())
            };

            if available == 0 {
                return std::task::Poll::Ready(Ok(()));
            }

            let data = &self.data[self.pos..self.pos + available];
            buf.put_slice(data);
            self.pos += available;

            std::task::Poll::Ready(Ok(()))
        }
    }

    fn arbitrary_inner_encoding() -> impl Strategy<Value = i32> {
        prop::sample::select(vec![
            ENCODING_RAW,
            ENCODING_COPYRECT,
            ENCODING_RRE,
            ENCODING_HEXTILE,
            ENCODING_TIGHT,
            ENCODING_ZRLE,
        ])
    }

    async fn encode_rect_and_init(
        rect: &Rectangle,
        init: &CachedRectInit,
    ) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut out = RfbOutStream::new(&mut buffer);
        rect.write_to(&mut out);
        init.write_to(&mut out).unwrap();
        out.flush().await.unwrap();
        buffer
    }

    proptest! {
        /// A rect header followed by an init body parses identically no
        /// matter where the stream fragments.
        #[test]
        fn test_init_survives_fragmentation(
            cache_id in 1u64..,
            encoding in arbitrary_inner_encoding(),
            x in 0u16..=1920,
            y in 0u16..=1080,
            w in 1u16..=640,
            h in 1u16..=480,
            boundary in 0usize..24,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let rect = Rectangle {
                    x,
                    y,
                    width: w,
                    height: h,
                    encoding: ENCODING_CACHED_RECT_INIT,
                };
                let init = CachedRectInit::new(cache_id, encoding);
                let bytes = encode_rect_and_init(&rect, &init).await;

                let reader = FragmentingReader::new(bytes, boundary);
                let mut stream = RfbInStream::new(reader);
                let rect_back = Rectangle::read_from(&mut stream).await.unwrap();
                let init_back = CachedRectInit::read_from(&mut stream).await.unwrap();

                prop_assert_eq!(rect_back, rect);
                prop_assert_eq!(init_back, init);
                Ok(())
            })?;
        }

        /// Reference bodies round-trip for any non-zero id at any boundary.
        #[test]
        fn test_ref_survives_fragmentation(
            cache_id in 1u64..,
            boundary in 0usize..8,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let mut buffer = Vec::new();
                let mut out = RfbOutStream::new(&mut buffer);
                PersistentCachedRect::new(cache_id).write_to(&mut out).unwrap();
                out.flush().await.unwrap();

                let reader = FragmentingReader::new(buffer, boundary);
                let mut stream = RfbInStream::new(reader);
                let back = PersistentCachedRect::read_from(&mut stream).await.unwrap();
                prop_assert_eq!(back.cache_id, cache_id);
                Ok(())
            })?;
        }
    }
}
