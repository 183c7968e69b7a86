//! `multipart/form-data` bodies for uploads.

use rand::Rng;

#[derive(Clone, Debug)]
pub struct FilePart {
    pub field: String,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MultipartForm {
    boundary: String,
    fields: Vec<(String, String)>,
    files: Vec<FilePart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        let token: u64 = rand::thread_rng().gen();
        Self::with_boundary(format!("----sentinel-{:016x}", token))
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            fields: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: impl ToString) -> Self {
        self.fields.push((name.to_string(), value.to_string()));
        self
    }

    pub fn file(mut self, part: FilePart) -> Self {
        self.files.push(part);
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn files(&self) -> &[FilePart] {
        &self.files
    }

    /// Returns the `Content-Type` header value and the encoded body.
    pub fn encode(&self) -> (String, Vec<u8>) {
        let mut body = Vec::new();
        for (name, value) in &self.fields {
            body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    escape_quotes(name)
                )
                .as_bytes(),
            );
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        for file in &self.files {
            body.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    escape_quotes(&file.field),
                    escape_quotes(&file.filename)
                )
                .as_bytes(),
            );
            body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", file.content_type).as_bytes());
            body.extend_from_slice(&file.bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            body,
        )
    }
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_quotes(value: &str) -> String {
    value.replace('"', "%22")
}
