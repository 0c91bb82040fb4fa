use super::PgClient;
use crate::copy::{
    BinaryExporter, BinaryImporter, CopyDirection, RawCopyStream, TextExporter, TextImporter,
    open_copy_in, open_copy_out,
};
use crate::error::SqlMiddlewareDbError;

impl PgClient {
    /// Open an unframed COPY stream. `FROM STDIN` commands are imports, everything else an export.
    ///
    /// # Errors
    /// Returns `ProtocolError` if another COPY channel is open, or the backend error unchanged.
    pub async fn begin_raw_binary_copy(
        &self,
        copy_command: &str,
    ) -> Result<RawCopyStream, SqlMiddlewareDbError> {
        let conn = self.connection()?;
        match CopyDirection::of_command(copy_command) {
            CopyDirection::Import => {
                let (sink, lease) = open_copy_in(&conn, copy_command).await?;
                Ok(RawCopyStream::import(sink, lease))
            }
            CopyDirection::Export => {
                let (stream, lease) = open_copy_out(&conn, copy_command).await?;
                Ok(RawCopyStream::export(stream, lease))
            }
        }
    }

    /// Open a text export, e.g. `COPY items TO STDOUT`.
    ///
    /// # Errors
    /// Returns `ProtocolError` for a `FROM STDIN` command or if another COPY channel is open,
    /// or the backend error unchanged.
    pub async fn begin_text_export(
        &self,
        copy_command: &str,
    ) -> Result<TextExporter, SqlMiddlewareDbError> {
        CopyDirection::Export.require(copy_command)?;
        let conn = self.connection()?;
        let (stream, lease) = open_copy_out(&conn, copy_command).await?;
        Ok(TextExporter::new(stream, lease))
    }

    /// Open a text import, e.g. `COPY items (id, name) FROM STDIN`.
    ///
    /// # Errors
    /// Returns `ProtocolError` unless the command is `FROM STDIN` or if another COPY channel is
    /// open, or the backend error unchanged.
    pub async fn begin_text_import(
        &self,
        copy_command: &str,
    ) -> Result<TextImporter, SqlMiddlewareDbError> {
        CopyDirection::Import.require(copy_command)?;
        let conn = self.connection()?;
        let (sink, lease) = open_copy_in(&conn, copy_command).await?;
        Ok(TextImporter::new(sink, lease))
    }

    /// Open a binary export, e.g. `COPY items TO STDOUT (FORMAT binary)`.
    ///
    /// # Errors
    /// Returns `ProtocolError` for a `FROM STDIN` command or if another COPY channel is open,
    /// or the backend error unchanged.
    pub async fn begin_binary_export(
        &self,
        copy_command: &str,
    ) -> Result<BinaryExporter, SqlMiddlewareDbError> {
        CopyDirection::Export.require(copy_command)?;
        let conn = self.connection()?;
        let (stream, lease) = open_copy_out(&conn, copy_command).await?;
        Ok(BinaryExporter::new(stream, lease))
    }

    /// Open a binary import, e.g. `COPY items (id, name) FROM STDIN (FORMAT binary)`.
    ///
    /// # Errors
    /// Returns `ProtocolError` unless the command is `FROM STDIN` or if another COPY channel is
    /// open, or the backend error unchanged.
    pub async fn begin_binary_import(
        &self,
        copy_command: &str,
    ) -> Result<BinaryImporter, SqlMiddlewareDbError> {
        CopyDirection::Import.require(copy_command)?;
        let conn = self.connection()?;
        let (sink, lease) = open_copy_in(&conn, copy_command).await?;
        Ok(BinaryImporter::new(sink, lease))
    }
}
