use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use markpdf_core::{ImageMime, ImagePayload};

use crate::error::{ComposeError, Result};

/// Image XObject registered in the document, with its pixel dimensions.
pub struct EmbeddedImage {
    pub object_id: ObjectId,
    pub width: u32,
    pub height: u32,
}

/// Decode an annotation payload and add it to the document as an image
/// XObject.
///
/// JPEG bytes pass through untouched under a DCTDecode filter. PNG is
/// re-encoded as flate-compressed raw RGB; a non-opaque alpha channel
/// becomes a separate SMask stream.
pub fn embed_image(doc: &mut Document, payload: &ImagePayload) -> Result<EmbeddedImage> {
    let bytes = payload.decoded()?;
    // The declared mime selects the PDF filter, so bytes of another format
    // would embed as a broken image; reject the mismatch up front.
    let sniffed = image::guess_format(&bytes)
        .map_err(|err| ComposeError::ImageDecode(err.to_string()))?;
    let expected = match payload.mime {
        ImageMime::Png => image::ImageFormat::Png,
        ImageMime::Jpeg => image::ImageFormat::Jpeg,
    };
    if sniffed != expected {
        return Err(ComposeError::ImageDecode(format!(
            "payload declared {} but bytes are {:?}",
            payload.mime.as_str(),
            sniffed
        )));
    }
    let decoded = image::load_from_memory(&bytes)
        .map_err(|err| ComposeError::ImageDecode(err.to_string()))?;
    let (width, height) = (decoded.width(), decoded.height());

    let object_id = match payload.mime {
        ImageMime::Jpeg => {
            let color_space = if decoded.color().channel_count() == 1 {
                "DeviceGray"
            } else {
                "DeviceRGB"
            };
            let dict = dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => color_space,
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            };
            doc.add_object(Stream::new(dict, bytes).with_compression(false))
        }
        ImageMime::Png => {
            let rgba = decoded.to_rgba8();
            let mut rgb = Vec::with_capacity(rgba.len() / 4 * 3);
            let mut alpha = Vec::with_capacity(rgba.len() / 4);
            let mut opaque = true;
            for pixel in rgba.pixels() {
                rgb.extend_from_slice(&pixel.0[..3]);
                alpha.push(pixel.0[3]);
                if pixel.0[3] != 255 {
                    opaque = false;
                }
            }

            let mut dict = dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            };

            if !opaque {
                let smask = dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => width as i64,
                    "Height" => height as i64,
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 8,
                    "Filter" => "FlateDecode",
                };
                let smask_id = doc
                    .add_object(Stream::new(smask, deflate(&alpha)?).with_compression(false));
                dict.set("SMask", Object::Reference(smask_id));
            }

            doc.add_object(Stream::new(dict, deflate(&rgb)?).with_compression(false))
        }
    };

    Ok(EmbeddedImage {
        object_id,
        width,
        height,
    })
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|err| ComposeError::ImageDecode(err.to_string()))
}
