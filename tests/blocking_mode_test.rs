#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use pullwire::streaming::{from_iter, from_stream, Decoder, DemandSignal, IoSink};
    use pullwire::transport::Requester;
    use pullwire::{ItemStream, Outcome, Registry, StreamError};
    use tokio::net::{TcpListener, TcpStream};

    /// Delivers signals straight into an in-process registry
    struct LocalRequester {
        registry: Registry,
    }

    #[async_trait]
    impl Requester for LocalRequester {
        async fn send(&self, signal: DemandSignal) -> pullwire::Result<()> {
            self.registry.signal(signal.id, signal.signal);
            Ok(())
        }
    }

    async fn connected() -> anyhow::Result<(TcpStream, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        Ok((client?, accepted?.0))
    }

    #[tokio::test]
    async fn test_blocking_serve_over_tcp() -> anyhow::Result<()> {
        pullwire::logging::init_for_tests();
        let (client, server_side) = connected().await?;
        let registry = Registry::default();

        let items: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i; i as usize]).collect();
        let serving = {
            let registry = registry.clone();
            let items = items.clone();
            tokio::spawn(async move {
                registry
                    .serve(from_iter(items), Box::new(IoSink::new(server_side)), 0)
                    .await
            })
        };

        let requester = Arc::new(LocalRequester {
            registry: registry.clone(),
        });
        let stream = ItemStream::new(Box::new(Decoder::new(client, requester)), 7)?;
        let got = stream.collect_all().await?;

        assert_eq!(got, items.into_iter().map(Bytes::from).collect::<Vec<_>>());
        assert_eq!(serving.await??, Outcome::Completed);
        assert!(registry.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_blocking_serve_reports_cancel() -> anyhow::Result<()> {
        let (client, server_side) = connected().await?;
        let registry = Registry::default();

        let serving = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let endless = futures::stream::repeat(Ok::<_, std::convert::Infallible>(
                    Bytes::from_static(b"x"),
                ));
                registry
                    .serve(from_stream(endless), Box::new(IoSink::new(server_side)), 0)
                    .await
            })
        };

        let requester = Arc::new(LocalRequester {
            registry: registry.clone(),
        });
        let mut stream = ItemStream::new(Box::new(Decoder::new(client, requester)), 1)?;
        for _ in 0..5 {
            assert_eq!(&stream.next().await.unwrap()?[..], b"x");
        }
        drop(stream);

        assert_eq!(serving.await??, Outcome::Cancelled);
        assert!(registry.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_closing_early_is_protocol_error() -> anyhow::Result<()> {
        let (client, server_side) = connected().await?;
        drop(server_side);

        let registry = Registry::default();
        let requester = Arc::new(LocalRequester { registry });
        let err = ItemStream::new(Box::new(Decoder::new(client, requester)), 1)?
            .collect_all()
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
        Ok(())
    }
}
