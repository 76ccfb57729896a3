use anyhow::{Context, Result};
use ndarray::{Array3, Array4, Axis};

use super::{
    BatchLayout, LayerPrompt, LayerPromptSlice, PrefixEmbedding, PrefixGeometry, PrefixProjector,
    PromptBundle, PromptKind,
};
use crate::error::PrefixError;
use crate::weights::ParamStore;

/// One prefix path: an embedding table followed by its projector.
#[derive(Debug, Clone)]
pub struct PrefixPath {
    pub embedding: PrefixEmbedding,
    pub projector: PrefixProjector,
}

impl PrefixPath {
    pub fn new(embedding: PrefixEmbedding, projector: PrefixProjector) -> Self {
        Self { embedding, projector }
    }

    pub fn from_store(store: &mut ParamStore, kind: PromptKind, geometry: &PrefixGeometry) -> Result<Self> {
        let prefix = kind.param_prefix();
        let embedding = PrefixEmbedding::from_store(
            store,
            &format!("{}.embedding", prefix),
            geometry.preseqlen,
            geometry.d_model,
        )?;
        let projector = PrefixProjector::from_store(
            store,
            &format!("{}.projector", prefix),
            geometry.d_model,
            geometry.mid_dim,
            geometry.projected_width(),
        )?;
        Ok(Self::new(embedding, projector))
    }

    /// `(batch, preseqlen, projected_width)`
    pub fn project(&self, batch: usize) -> Result<Array3<f32>> {
        let embedded = self.embedding.forward(batch);
        self.projector.forward(&embedded.view())
    }
}

/// Turns the three prefix paths into a [`PromptBundle`].
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    geometry: PrefixGeometry,
    decoder: PrefixPath,
    cross: PrefixPath,
    encoder: PrefixPath,
}

impl PromptAssembler {
    pub fn new(
        geometry: PrefixGeometry,
        decoder: PrefixPath,
        cross: PrefixPath,
        encoder: PrefixPath,
    ) -> Result<Self, PrefixError> {
        geometry.validate()?;
        for (kind, path) in [
            (PromptKind::Decoder, &decoder),
            (PromptKind::Cross, &cross),
            (PromptKind::Encoder, &encoder),
        ] {
            if path.projector.out_dim() != geometry.projected_width() {
                return Err(PrefixError::ProjectorWidth {
                    path: kind.as_str(),
                    expected: geometry.projected_width(),
                    actual: path.projector.out_dim(),
                });
            }
            if path.embedding.preseqlen() != geometry.preseqlen {
                return Err(PrefixError::PrefixLength {
                    path: kind.as_str(),
                    expected: geometry.preseqlen,
                    actual: path.embedding.preseqlen(),
                });
            }
        }
        Ok(Self {
            geometry,
            decoder,
            cross,
            encoder,
        })
    }

    /// Loads all three paths from `prefix.{decoder,cross,encoder}.*`.
    pub fn from_store(store: &mut ParamStore, geometry: PrefixGeometry) -> Result<Self> {
        geometry.validate()?;
        let decoder = PrefixPath::from_store(store, PromptKind::Decoder, &geometry)?;
        let cross = PrefixPath::from_store(store, PromptKind::Cross, &geometry)?;
        let encoder = PrefixPath::from_store(store, PromptKind::Encoder, &geometry)?;
        Ok(Self::new(geometry, decoder, cross, encoder)?)
    }

    pub fn geometry(&self) -> &PrefixGeometry {
        &self.geometry
    }

    /// Builds the per-layer prompts for one generation call.
    ///
    /// Decoder and cross-attention prompts are sized for
    /// `layout.decoder_batch()`, encoder prompts for `layout.encoder_batch()`.
    /// The result depends only on the parameters and the layout.
    pub fn assemble(&self, layout: BatchLayout) -> Result<PromptBundle> {
        let decoder = self.split(&self.decoder, layout.decoder_batch(), PromptKind::Decoder)?;
        let cross = self.split(&self.cross, layout.decoder_batch(), PromptKind::Cross)?;
        let encoder = self.split(&self.encoder, layout.encoder_batch(), PromptKind::Encoder)?;

        let layers = decoder
            .into_iter()
            .zip(cross)
            .zip(encoder)
            .map(|((decoder_prompt, cross_attention_prompt), encoder_prompt)| LayerPrompt {
                decoder_prompt,
                cross_attention_prompt,
                encoder_prompt,
            })
            .collect();

        Ok(PromptBundle { layout, layers })
    }

    /// Projects one path and splits it into `num_layers` key/value slices.
    ///
    /// `(B, L, layers*2*heads*head_dim)` is viewed as `(B, L, layers*2, heads, head_dim)`,
    /// permuted to `(layers*2, B, heads, L, head_dim)` and read two rows at a time.
    fn split(&self, path: &PrefixPath, batch: usize, kind: PromptKind) -> Result<Vec<LayerPromptSlice>> {
        let g = &self.geometry;
        let projected = path
            .project(batch)
            .with_context(|| format!("failed to project {} prefix", kind.as_str()))?;

        let grouped = projected
            .into_shape_with_order((batch, g.preseqlen, g.num_layers * 2, g.num_heads, g.head_dim))
            .map_err(PrefixError::from)?;
        let permuted = grouped.permuted_axes([2, 0, 3, 1, 4]);

        let take = |row: usize| -> Array4<f32> {
            permuted
                .index_axis(Axis(0), row)
                .as_standard_layout()
                .into_owned()
        };

        Ok((0..g.num_layers)
            .map(|layer| LayerPromptSlice::new(take(2 * layer), take(2 * layer + 1)))
            .collect())
    }
}
