//! Protocolo de salida worker -> controller.
//!
//! El worker escribe un único mensaje por job, con framing versionado:
//!
//! ```text
//! cabecera : "UMJ" | versión u8 | tipo u8 | largo total u64 BE
//! bloques  : (largo u32 BE | bytes)*   con 0 < largo <= block_size
//! fin      : largo u32 BE = 0
//! ```
//!
//! Un payload que entra en `block_size` se escribe en una sola operación;
//! uno más grande va en bloques fijos, y cada escritura bloquea hasta que el
//! otro lado consume (pipe o duplex acotado).

use std::io::Write;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::response::ResponseRecord;

pub const MAGIC: &[u8; 3] = b"UMJ";
pub const VERSION: u8 = 1;

/// Tamaño de bloque por defecto (bytes).
pub const DEFAULT_BLOCK_SIZE: usize = 5000;

/// Ningún bloque puede superar esto, venga lo que venga por el pipe.
pub const MAX_BLOCK_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 3 + 1 + 1 + 8;
const KIND_RESPONSE: u8 = 0;
const KIND_FAILURE: u8 = 1;

/// Lo que un worker le devuelve al controller.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Response(ResponseRecord),
    /// El worker abortó (p.ej. cohorte irresoluble).
    Failure(String),
}

impl WorkerMessage {
    fn encode(&self) -> Result<(u8, Vec<u8>)> {
        match self {
            WorkerMessage::Response(record) => Ok((KIND_RESPONSE, serde_json::to_vec(record)?)),
            WorkerMessage::Failure(reason) => Ok((KIND_FAILURE, reason.as_bytes().to_vec())),
        }
    }

    fn decode(kind: u8, payload: Vec<u8>) -> Result<Self> {
        match kind {
            KIND_RESPONSE => Ok(WorkerMessage::Response(serde_json::from_slice(&payload)?)),
            KIND_FAILURE => String::from_utf8(payload)
                .map(WorkerMessage::Failure)
                .map_err(|_| Error::protocol("mensaje de fallo no es UTF-8")),
            other => Err(Error::protocol(format!("tipo de mensaje desconocido: {other}"))),
        }
    }
}

/// Serializa y escribe un mensaje completo.
pub fn write_message<W: Write>(out: &mut W, message: &WorkerMessage, block_size: usize) -> Result<()> {
    let (kind, payload) = message.encode()?;
    write_frames(out, kind, &payload, block_size)
}

pub fn write_frames<W: Write>(out: &mut W, kind: u8, payload: &[u8], block_size: usize) -> Result<()> {
    if block_size == 0 || block_size > MAX_BLOCK_LEN {
        return Err(Error::protocol(format!(
            "block_size fuera de rango: {block_size} (1..={MAX_BLOCK_LEN})"
        )));
    }

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.push(VERSION);
    header.push(kind);
    header.extend_from_slice(&(payload.len() as u64).to_be_bytes());

    if payload.len() <= block_size {
        // cabe en un bloque: una sola escritura
        let mut frame = header;
        if !payload.is_empty() {
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            frame.extend_from_slice(payload);
        }
        frame.extend_from_slice(&0u32.to_be_bytes());
        out.write_all(&frame)?;
        out.flush()?;
        return Ok(());
    }

    out.write_all(&header)?;
    for block in payload.chunks(block_size) {
        let mut frame = Vec::with_capacity(4 + block.len());
        frame.extend_from_slice(&(block.len() as u32).to_be_bytes());
        frame.extend_from_slice(block);
        out.write_all(&frame)?;
        out.flush()?;
    }
    out.write_all(&0u32.to_be_bytes())?;
    out.flush()?;
    Ok(())
}

/// Lee el stream de un worker hasta el marcador de fin y lo decodifica.
pub async fn read_message<R: AsyncRead + Unpin>(input: &mut R) -> Result<WorkerMessage> {
    let (kind, payload) = read_frames(input).await?;
    WorkerMessage::decode(kind, payload)
}

/// Reensambla los bloques. Devuelve el tipo y los bytes exactos del payload.
pub async fn read_frames<R: AsyncRead + Unpin>(input: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(input, &mut header, "cabecera").await?;

    if &header[..3] != MAGIC {
        return Err(Error::protocol("magic inválido en la cabecera"));
    }
    if header[3] != VERSION {
        return Err(Error::protocol(format!("versión no soportada: {}", header[3])));
    }
    let kind = header[4];
    if kind != KIND_RESPONSE && kind != KIND_FAILURE {
        return Err(Error::protocol(format!("tipo de mensaje desconocido: {kind}")));
    }

    let mut total = [0u8; 8];
    total.copy_from_slice(&header[5..]);
    let total = u64::from_be_bytes(total) as usize;

    let mut payload = Vec::with_capacity(total.min(MAX_BLOCK_LEN));
    loop {
        let mut len = [0u8; 4];
        read_exact(input, &mut len, "largo de bloque").await?;
        let len = u32::from_be_bytes(len) as usize;

        if len == 0 {
            break;
        }
        if len > MAX_BLOCK_LEN {
            return Err(Error::protocol(format!("bloque demasiado grande: {len} bytes")));
        }
        if payload.len() + len > total {
            return Err(Error::protocol(format!(
                "los bloques superan el largo declarado ({total} bytes)"
            )));
        }

        let start = payload.len();
        payload.resize(start + len, 0);
        read_exact(input, &mut payload[start..], "bloque").await?;
    }

    if payload.len() != total {
        return Err(Error::protocol(format!(
            "payload incompleto: {} de {} bytes",
            payload.len(),
            total
        )));
    }

    Ok((kind, payload))
}

async fn read_exact<R: AsyncRead + Unpin>(input: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match input.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::protocol(format!("stream truncado leyendo {what}")))
        }
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{KeyedRows, ResponseData};
    use serde_json::json;
    use std::collections::BTreeMap;

    /// Writer que cuenta cuántas veces se le escribió.
    #[derive(Default)]
    struct CountingWriter {
        buf: Vec<u8>,
        writes: usize,
    }

    impl Write for CountingWriter {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.writes += 1;
            self.buf.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn reensambla_exactamente_alrededor_del_umbral() {
        let block = 64;
        for len in [0, 1, block - 1, block, block + 1, 3 * block, 3 * block + 7] {
            let original = payload(len);
            let mut out = Vec::new();
            write_frames(&mut out, KIND_RESPONSE, &original, block).unwrap();

            let mut reader: &[u8] = &out;
            let (kind, back) = read_frames(&mut reader).await.unwrap();

            assert_eq!(kind, KIND_RESPONSE);
            assert_eq!(back, original, "largo {len}");
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn payload_chico_va_en_una_sola_escritura() {
        let mut small = CountingWriter::default();
        write_frames(&mut small, KIND_RESPONSE, &payload(100), 100).unwrap();
        assert_eq!(small.writes, 1);

        let mut big = CountingWriter::default();
        write_frames(&mut big, KIND_RESPONSE, &payload(250), 100).unwrap();
        // cabecera + 3 bloques + fin
        assert_eq!(big.writes, 5);
    }

    #[test]
    fn ningun_bloque_supera_block_size() {
        let mut out = Vec::new();
        write_frames(&mut out, KIND_RESPONSE, &payload(1000), 128).unwrap();

        let mut pos = HEADER_LEN;
        loop {
            let mut len = [0u8; 4];
            len.copy_from_slice(&out[pos..pos + 4]);
            let len = u32::from_be_bytes(len) as usize;
            pos += 4;
            if len == 0 {
                break;
            }
            assert!(len <= 128);
            pos += len;
        }
        assert_eq!(pos, out.len());
    }

    #[tokio::test]
    async fn mensaje_de_respuesta_ida_y_vuelta() {
        let record = ResponseRecord {
            header: vec!["timestamp".to_string(), "sum_edit_count".to_string()],
            cohort_expr: "all".to_string(),
            cohort_gen_timestamp: "20240101000000".to_string(),
            metric: "edit_count".to_string(),
            timeseries: true,
            aggregator: Some("sum".to_string()),
            start: "20240101000000".to_string(),
            end: "20240103000000".to_string(),
            params: BTreeMap::new(),
            data: ResponseData::Keyed(KeyedRows::from_iter([
                ("20240101000000".to_string(), vec![json!(4)]),
                ("20240102000000".to_string(), vec![json!(0)]),
            ])),
        };
        let message = WorkerMessage::Response(record);

        let mut out = Vec::new();
        write_message(&mut out, &message, 16).unwrap();
        let mut reader: &[u8] = &out;

        assert_eq!(read_message(&mut reader).await.unwrap(), message);
    }

    #[tokio::test]
    async fn stream_truncado_es_error_de_protocolo() {
        let mut out = Vec::new();
        write_frames(&mut out, KIND_RESPONSE, &payload(300), 100).unwrap();

        for cut in [0, 5, HEADER_LEN + 2, HEADER_LEN + 50, out.len() - 1] {
            let mut reader: &[u8] = &out[..cut];
            let err = read_frames(&mut reader).await.unwrap_err();
            assert!(matches!(err, Error::Protocol { .. }), "corte en {cut}");
        }
    }

    #[tokio::test]
    async fn rechaza_magic_version_y_json_invalidos() {
        let mut reader: &[u8] = b"eval(\"rm -rf\")\n";
        assert!(matches!(
            read_frames(&mut reader).await,
            Err(Error::Protocol { .. })
        ));

        let mut out = Vec::new();
        write_frames(&mut out, KIND_RESPONSE, b"{}", 100).unwrap();
        out[3] = 9;
        let mut reader: &[u8] = &out;
        assert!(read_frames(&mut reader).await.is_err());

        let mut out = Vec::new();
        write_frames(&mut out, KIND_RESPONSE, b"{no es json", 100).unwrap();
        let mut reader: &[u8] = &out;
        assert!(matches!(
            read_message(&mut reader).await,
            Err(Error::Json(_))
        ));
    }

    #[tokio::test]
    async fn mensaje_de_fallo_viaja_como_texto() {
        let message = WorkerMessage::Failure("cohorte desconocida".to_string());
        let mut out = Vec::new();
        write_message(&mut out, &message, DEFAULT_BLOCK_SIZE).unwrap();
        let mut reader: &[u8] = &out;

        assert_eq!(read_message(&mut reader).await.unwrap(), message);
    }
}
