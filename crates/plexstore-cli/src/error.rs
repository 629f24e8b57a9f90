use plexstore_core::ConvertError;

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Archive not found or not accessible: {path}"))]
    ArchiveMissing {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Not a readable zip archive: {path}"))]
    ArchiveUnreadable {
        path: String,
        #[snafu(source(from(zip::result::ZipError, Box::new)))]
        source: Box<zip::result::ZipError>,
    },

    #[snafu(display("Archive {path} has no {what} member"))]
    MemberMissing { path: String, what: &'static str },

    #[snafu(display(
        "Archive {path} has more than one {what} member: {first}, {second}"
    ))]
    MemberAmbiguous {
        path: String,
        what: &'static str,
        first: String,
        second: String,
    },

    #[snafu(display("Failed to open member {member} of {path}"))]
    MemberUnreadable {
        path: String,
        member: String,
        #[snafu(source(from(zip::result::ZipError, Box::new)))]
        source: Box<zip::result::ZipError>,
    },

    #[snafu(display("Failed to read member {member} of {path}"))]
    MemberRead {
        path: String,
        member: String,
        source: std::io::Error,
    },

    #[snafu(display(
        "--output can only be used with a single archive ({count} given)"
    ))]
    OutputWithManyArchives { count: usize },

    #[snafu(display("Conversion of {archive} into {output} failed"))]
    Convert {
        archive: String,
        output: String,
        #[snafu(source(from(ConvertError, Box::new)))]
        source: Box<ConvertError>,
    },

    #[snafu(display("Failed to render conversion report"))]
    Report { source: serde_json::Error },
}
