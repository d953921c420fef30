//! Terminal stand-in for a chat platform

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_chat::{Delivery, DeliveryError, MessageHandle, Notice, NoticeKind};
use std::io::Write;

/// Prints sent messages and renders edits as appended text.
///
/// A terminal cannot rewrite old output, so an edit that extends the
/// previous text prints only the new suffix. Any other edit reprints the
/// whole message. Only the most recent message stays editable.
pub struct ConsoleDelivery {
    out: Mutex<Box<dyn Write + Send>>,
    /// Id and last shown text of the most recent message
    open: Mutex<Option<(String, String)>>,
}

impl ConsoleDelivery {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            open: Mutex::new(None),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    fn write(&self, text: &str) -> Result<(), DeliveryError> {
        let mut out = self.out.lock();
        out.write_all(text.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| DeliveryError::Platform(e.to_string()))
    }
}

#[async_trait]
impl Delivery for ConsoleDelivery {
    async fn send_new(
        &self,
        channel_id: &str,
        text: &str,
        _reply_to: Option<&str>,
    ) -> Result<MessageHandle, DeliveryError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.write(&format!("\n{}", text))?;
        *self.open.lock() = Some((id.clone(), text.to_string()));
        Ok(MessageHandle::new(channel_id, id))
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), DeliveryError> {
        let mut open = self.open.lock();
        let Some((id, shown)) = open.as_mut().filter(|(id, _)| *id == handle.message_id) else {
            return Err(DeliveryError::UnknownMessage(handle.message_id.clone()));
        };

        match text.strip_prefix(shown.as_str()) {
            Some(suffix) => self.write(suffix)?,
            None => self.write(&format!("\n{}", text))?,
        }
        *shown = text.to_string();
        tracing::trace!(message = %id, "edited console message");
        Ok(())
    }

    async fn send_notice(
        &self,
        channel_id: &str,
        notice: &Notice,
    ) -> Result<MessageHandle, DeliveryError> {
        let marker = match notice.kind {
            NoticeKind::Success => "[ok]",
            NoticeKind::Error => "[error]",
        };
        let text = format!("{} {}: {}", marker, notice.title, notice.description);
        self.send_new(channel_id, &text, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn console() -> (ConsoleDelivery, SharedBuf) {
        let buf = SharedBuf::default();
        (ConsoleDelivery::new(Box::new(buf.clone())), buf)
    }

    #[tokio::test]
    async fn test_edit_appends_suffix() {
        let (console, buf) = console();
        let handle = console.send_new("console", "Hello", None).await.unwrap();
        console.edit(&handle, "Hello world").await.unwrap();
        assert_eq!(buf.contents(), "\nHello world");
    }

    #[tokio::test]
    async fn test_unrelated_edit_reprints() {
        let (console, buf) = console();
        let handle = console.send_new("console", "⌛ Generating", None).await.unwrap();
        console.edit(&handle, "Answer").await.unwrap();
        assert_eq!(buf.contents(), "\n⌛ Generating\nAnswer");
    }

    #[tokio::test]
    async fn test_edit_unknown_message() {
        let (console, _buf) = console();
        let handle = MessageHandle::new("console", "missing");
        let err = console.edit(&handle, "text").await.unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownMessage(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_only_latest_message_is_kept() {
        let (console, buf) = console();
        let mut handles = Vec::new();
        for i in 0..1000 {
            let handle = console.send_new("console", &i.to_string(), None).await.unwrap();
            console.edit(&handle, &format!("{}!", i)).await.unwrap();
            handles.push(handle);
        }
        assert!(console.open.lock().as_ref().is_some_and(|(id, text)| {
            *id == handles[999].message_id && text == "999!"
        }));

        let err = console.edit(&handles[0], "late").await.unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownMessage(_)));
        assert!(buf.contents().ends_with("\n999!"));
    }

    #[tokio::test]
    async fn test_notice_rendering() {
        let (console, buf) = console();
        console
            .send_notice("console", &Notice::error("Error", "Try again"))
            .await
            .unwrap();
        assert_eq!(buf.contents(), "\n[error] Error: Try again");
    }

    #[tokio::test]
    async fn test_handles_are_unique() {
        let (console, _buf) = console();
        let a = console.send_new("console", "a", None).await.unwrap();
        let b = console.send_new("console", "b", None).await.unwrap();
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.channel_id, "console");
    }
}
