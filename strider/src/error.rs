#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Geom {
        #[from]
        source: strider_mvg::GeomError,
    },
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
    #[error("{source}")]
    SerdeYaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("mismatched stereo images: {0}")]
    MismatchedImages(String),
    #[error("frame {got} arrived after frame {newest}")]
    OutOfOrderFrame {
        got: crate::FrameId,
        newest: crate::FrameId,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
