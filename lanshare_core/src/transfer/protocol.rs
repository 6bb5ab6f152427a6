//! Wire framing of the private transfer protocol.
//!
//! A transfer is a single TCP connection carrying, in order:
//! nickname, accent colour, avatar bytes and file name, each as a
//! little-endian `u32` length followed by that many bytes, then the file
//! length as a little-endian `u64`, then the raw file bytes.

use crate::error::{TransferError, TransferResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{MAX_FILENAME_LENGTH, MAX_HEADER_FIELD_LEN};

/// Metadata sent ahead of the file bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub nickname: String,
    pub accent_color: String,
    pub avatar: Option<Vec<u8>>,
    pub file_name: String,
    pub file_size: u64,
}

impl TransferHeader {
    /// Serialize the header into its exact wire representation
    pub fn encode(&self) -> Vec<u8> {
        let avatar = self.avatar.as_deref().unwrap_or_default();
        let mut buf = Vec::with_capacity(
            16 + self.nickname.len() + self.accent_color.len() + avatar.len() + self.file_name.len() + 8,
        );
        for field in [
            self.nickname.as_bytes(),
            self.accent_color.as_bytes(),
            avatar,
            self.file_name.as_bytes(),
        ] {
            buf.extend_from_slice(&(field.len() as u32).to_le_bytes());
            buf.extend_from_slice(field);
        }
        buf.extend_from_slice(&self.file_size.to_le_bytes());
        buf
    }
}

/// Write the header fields in protocol order
pub async fn write_header<W>(writer: &mut W, header: &TransferHeader) -> TransferResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&header.encode()).await?;
    Ok(())
}

/// Read a header, blocking until every declared field length is satisfied
pub async fn read_header<R>(reader: &mut R) -> TransferResult<TransferHeader>
where
    R: AsyncRead + Unpin,
{
    let nickname = read_string(reader, "nickname", MAX_HEADER_FIELD_LEN).await?;
    let accent_color = read_string(reader, "accent_color", MAX_HEADER_FIELD_LEN).await?;
    let avatar = read_field(reader, "avatar", MAX_HEADER_FIELD_LEN).await?;
    // file names get sanitized later; only bound the allocation here
    let file_name = read_string(reader, "file_name", (MAX_FILENAME_LENGTH * 16) as u64).await?;

    let mut len_buf = [0u8; 8];
    read_exact(reader, &mut len_buf, "file_size").await?;
    let file_size = u64::from_le_bytes(len_buf);

    Ok(TransferHeader {
        nickname,
        accent_color,
        avatar: (!avatar.is_empty()).then_some(avatar),
        file_name,
        file_size,
    })
}

async fn read_field<R>(reader: &mut R, field: &'static str, max: u64) -> TransferResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact(reader, &mut len_buf, field).await?;
    let len = u32::from_le_bytes(len_buf) as u64;
    if len > max {
        return Err(TransferError::FieldTooLarge { field, len, max });
    }

    let mut buf = vec![0u8; len as usize];
    read_exact(reader, &mut buf, field).await?;
    Ok(buf)
}

async fn read_string<R>(reader: &mut R, field: &'static str, max: u64) -> TransferResult<String>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_field(reader, field, max).await?;
    String::from_utf8(bytes).map_err(|_| TransferError::InvalidUtf8 { field })
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8], field: &'static str) -> TransferResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TransferError::PrematureEndOfStream { field })
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransferHeader {
        TransferHeader {
            nickname: "Alice".to_string(),
            accent_color: "#FF0078D4".to_string(),
            avatar: Some(vec![0xFF, 0xD8, 0xFF, 0xE0]),
            file_name: "holiday photos.zip".to_string(),
            file_size: 10_000_000,
        }
    }

    #[tokio::test]
    async fn test_header_roundtrip() {
        let header = sample();
        let bytes = header.encode();
        let parsed = read_header(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(parsed, header);
    }

    #[tokio::test]
    async fn test_header_without_avatar() {
        let header = TransferHeader {
            avatar: None,
            ..sample()
        };
        let parsed = read_header(&mut header.encode().as_slice()).await.unwrap();
        assert_eq!(parsed.avatar, None);
        assert_eq!(parsed.file_name, "holiday photos.zip");
    }

    #[test]
    fn test_wire_layout_is_little_endian() {
        let header = TransferHeader {
            nickname: "Al".to_string(),
            accent_color: "#1".to_string(),
            avatar: None,
            file_name: "a".to_string(),
            file_size: 258,
        };
        let bytes = header.encode();
        assert_eq!(
            bytes,
            vec![
                2, 0, 0, 0, b'A', b'l', //
                2, 0, 0, 0, b'#', b'1', //
                0, 0, 0, 0, //
                1, 0, 0, 0, b'a', //
                2, 1, 0, 0, 0, 0, 0, 0,
            ]
        );
    }

    #[tokio::test]
    async fn test_truncated_field_is_premature_eof() {
        let bytes = sample().encode();
        // cut in the middle of the nickname
        let err = read_header(&mut &bytes[..6]).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::PrematureEndOfStream { field: "nickname" }
        ));

        // cut inside the trailing file length
        let err = read_header(&mut &bytes[..bytes.len() - 3]).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::PrematureEndOfStream { field: "file_size" }
        ));
    }

    #[tokio::test]
    async fn test_oversized_field_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = read_header(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, TransferError::FieldTooLarge { .. }));
    }
}
