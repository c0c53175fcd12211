//! Reserved property and field names shared by the client and the server.

/// Property holding a document's metadata object.
pub const METADATA: &str = "@metadata";
/// Metadata entry holding the document key.
pub const METADATA_ID: &str = "@id";
/// Metadata entry holding the document etag.
pub const METADATA_ETAG: &str = "@etag";
/// Metadata entry holding the collection name.
pub const METADATA_COLLECTION: &str = "@collection";
/// Metadata entry holding the client type the document was written from.
pub const METADATA_RUST_TYPE: &str = "@rust-type";
/// Metadata flag set by the server on a read that may not be up to date.
pub const METADATA_NON_AUTHORITATIVE: &str = "@non-authoritative-information";

/// Field name the query language uses for the document key.
pub const DOCUMENT_ID_FIELD_NAME: &str = "id()";
/// Synthetic field carrying the document key in projected results.
pub const PROJECTED_ID_FIELD_NAME: &str = "__document_id";
/// Pseudo collection spanning every document.
pub const ALL_DOCUMENTS_COLLECTION: &str = "@all_docs";
