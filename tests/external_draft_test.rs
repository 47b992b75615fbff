//! TDD-Light tests for the external draft tokens layer.

use half::f16;
use specdec::layers::reset_skip_decoding;
use specdec::{
    AcceptanceThreshold, DecoderDomain, DecodingError, DecodingInputs, DecodingLayer, DecodingMode,
    ExternalDraftTokensInputs, ExternalDraftTokensLayer, FinishedState, SamplingSetupParams,
    SequenceBuffers, SetupParams, TokenId, Workspace,
};

const NO_EOS: TokenId = 999;

struct Harness {
    layer: ExternalDraftTokensLayer,
    workspace: Workspace,
    buffers: SequenceBuffers,
    end_ids: Vec<TokenId>,
}

impl Harness {
    fn new(domain: DecoderDomain, slots: &[usize], params: SamplingSetupParams) -> Self {
        let mode = DecodingMode::ExternalDraftTokens;
        let mut layer = ExternalDraftTokensLayer::new(mode, domain).unwrap();
        let mut workspace = Workspace::new(layer.workspace_size());
        layer
            .setup(slots, &SetupParams::ExternalDraftTokens(params), &mut workspace)
            .unwrap();
        Self {
            layer,
            workspace,
            buffers: SequenceBuffers::for_domain(&domain),
            end_ids: vec![NO_EOS; domain.max_batch_size()],
        }
    }

    /// Run one step without draft logits.
    fn step(
        &mut self,
        slots: &[usize],
        logits: &[f32],
        drafts: &[TokenId],
        num_draft: &[usize],
        step: usize,
    ) -> Result<(), DecodingError> {
        let use_draft_logits = vec![false; self.end_ids.len()];
        let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
            logits,
            bias: None,
            batch_slots: slots,
            end_ids: &self.end_ids,
            draft_logits: None,
            draft_token_ids: drafts,
            num_draft_tokens: num_draft,
            use_draft_logits: &use_draft_logits,
            step,
            acceptance: AcceptanceThreshold::Random,
        });
        self.layer.forward(&mut self.buffers.as_outputs(), &inputs, &mut self.workspace)
    }
}

/// Logit row with a single clear maximum at `peak`.
fn peaked(width: usize, peak: usize) -> Vec<f32> {
    let mut row = vec![0.0; width];
    row[peak] = 4.0;
    row
}

fn rows(width: usize, peaks: &[usize]) -> Vec<f32> {
    peaks.iter().flat_map(|&peak| peaked(width, peak)).collect()
}

#[test]
fn matching_draft_accepted_mismatch_gets_bonus() {
    let domain = DecoderDomain::new(2, 5, 5, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[0, 1], SamplingSetupParams::default().with_seed(42));

    let logits = rows(5, &[2, 4]);
    h.step(&[0, 1], &logits, &[2, 2], &[1, 1], 0).unwrap();

    assert!(h.layer.is_accepted(0));
    assert!(!h.layer.is_accepted(1));
    assert_eq!(h.buffers.tokens(0), &[2]);

    // The bonus token comes from the full target distribution.
    assert_eq!(h.layer.candidates(1).len(), 5);
    assert_eq!(h.layer.candidates(1)[0], 4);
    let bonus = h.buffers.tokens(1)[0];
    assert!(bonus < 5);
    assert_eq!(bonus, h.layer.target_output_id(1));

    assert_eq!(h.buffers.finished[0], FinishedState::Running);
    assert_eq!(h.buffers.finished[1], FinishedState::SkipDecoding);
    assert_eq!(h.buffers.sequence_lengths, vec![1, 1]);
}

#[test]
fn accepted_sequences_never_draw() {
    let domain = DecoderDomain::new(2, 5, 5, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[0, 1], SamplingSetupParams::default().with_seed(7));

    let logits = rows(5, &[2, 4]);
    h.step(&[0, 1], &logits, &[2, 2], &[1, 1], 0).unwrap();

    let generators = h.layer.runtime().generators();
    assert_eq!(generators.draws(0), 0);
    assert_eq!(generators.draws(1), 1);
}

#[test]
fn draft_cycle_runs_until_rejection_or_exhaustion() {
    let domain = DecoderDomain::new(2, 5, 5, 3, 8).unwrap();
    // Top-1 candidates make every target distribution one-hot.
    let params = SamplingSetupParams::default().with_seed(1).with_top_k(vec![1]);
    let mut h = Harness::new(domain, &[0, 1], params);
    let drafts = [1, 2, 3, 1, 2, 3];
    let num_draft = [3, 3];

    h.step(&[0, 1], &rows(5, &[1, 1]), &drafts, &num_draft, 0).unwrap();
    h.step(&[0, 1], &rows(5, &[2, 4]), &drafts, &num_draft, 1).unwrap();
    assert_eq!(h.buffers.finished[1], FinishedState::SkipDecoding);

    h.step(&[0, 1], &rows(5, &[3, 0]), &drafts, &num_draft, 2).unwrap();
    // Drafts exhausted: the bonus token closes the cycle.
    h.step(&[0, 1], &rows(5, &[0, 0]), &drafts, &num_draft, 3).unwrap();

    assert_eq!(h.buffers.tokens(0), &[1, 2, 3, 0]);
    assert_eq!(h.buffers.tokens(1), &[1, 4]);
    assert_eq!(h.buffers.finished, vec![FinishedState::SkipDecoding; 2]);

    reset_skip_decoding(&mut h.buffers.finished);
    assert_eq!(h.buffers.finished, vec![FinishedState::Running; 2]);
}

#[test]
fn finished_sequences_are_untouched() {
    let domain = DecoderDomain::new(2, 5, 5, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[0, 1], SamplingSetupParams::default());
    h.buffers.set_prompt(1, &[3, 3]).unwrap();
    h.buffers.finished[1] = FinishedState::FinishedEos;

    h.step(&[0, 1], &rows(5, &[2, 0]), &[2, 1], &[1, 1], 0).unwrap();

    assert_eq!(h.buffers.tokens(0), &[2]);
    assert_eq!(h.buffers.tokens(1), &[3, 3]);
    assert_eq!(h.buffers.finished[1], FinishedState::FinishedEos);
    assert_eq!(h.layer.runtime().generators().draws(1), 0);
}

#[test]
fn end_id_finishes_sequence() {
    let domain = DecoderDomain::new(1, 5, 5, 2, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default());
    h.end_ids = vec![3];

    h.step(&[0], &rows(5, &[3]), &[3, 1], &[2], 0).unwrap();

    assert_eq!(h.buffers.tokens(0), &[3]);
    assert_eq!(h.buffers.finished[0], FinishedState::FinishedEos);
}

#[test]
fn full_row_finishes_with_max_length() {
    let domain = DecoderDomain::new(1, 5, 5, 2, 2).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default());
    h.buffers.set_prompt(0, &[4]).unwrap();

    h.step(&[0], &rows(5, &[1]), &[1, 1], &[2], 0).unwrap();
    assert_eq!(h.buffers.tokens(0), &[4, 1]);
    assert_eq!(h.buffers.finished[0], FinishedState::FinishedMaxLength);

    // A finished row is skipped on later steps.
    h.step(&[0], &rows(5, &[1]), &[1, 1], &[2], 1).unwrap();
    assert_eq!(h.buffers.sequence_lengths[0], 2);
}

#[test]
fn full_row_that_is_still_running_is_rejected() {
    let domain = DecoderDomain::new(1, 5, 5, 1, 2).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default());
    h.buffers.set_prompt(0, &[4, 4]).unwrap();

    let err = h.step(&[0], &rows(5, &[1]), &[1], &[1], 0).unwrap_err();
    assert!(matches!(err, DecodingError::InvalidArgument(_)));
}

#[test]
fn equal_draft_and_target_probabilities_accepted() {
    let domain = DecoderDomain::new(1, 5, 5, 2, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default());
    let logits = vec![0.5f32, 1.5, 0.2, -0.3, 1.0];
    let mut draft_logits = logits.clone();
    draft_logits.extend_from_slice(&[0.0; 5]);

    let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
        logits: &logits,
        bias: None,
        batch_slots: &[0],
        end_ids: &h.end_ids,
        draft_logits: Some(&draft_logits[..]),
        draft_token_ids: &[1, 0],
        num_draft_tokens: &[2],
        use_draft_logits: &[true],
        step: 0,
        acceptance: AcceptanceThreshold::Constant(1.0),
    });
    h.layer.forward(&mut h.buffers.as_outputs(), &inputs, &mut h.workspace).unwrap();

    assert!(h.layer.is_accepted(0));
    assert_eq!(h.buffers.tokens(0), &[1]);
}

#[test]
fn unlikely_draft_rejected_by_probability_ratio() {
    let domain = DecoderDomain::new(1, 5, 5, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default().with_seed(5));
    let logits = peaked(5, 1);
    let draft_logits = peaked(5, 3);

    let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
        logits: &logits,
        bias: None,
        batch_slots: &[0],
        end_ids: &h.end_ids,
        draft_logits: Some(&draft_logits[..]),
        draft_token_ids: &[3],
        num_draft_tokens: &[1],
        use_draft_logits: &[true],
        step: 0,
        acceptance: AcceptanceThreshold::Constant(1.0),
    });
    h.layer.forward(&mut h.buffers.as_outputs(), &inputs, &mut h.workspace).unwrap();

    assert!(!h.layer.is_accepted(0));
    assert_eq!(h.buffers.finished[0], FinishedState::SkipDecoding);
    assert_eq!(h.layer.runtime().generators().draws(0), 1);
}

#[test]
fn random_threshold_draws_once_per_test() {
    let domain = DecoderDomain::new(1, 4, 4, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default().with_seed(9));
    let logits = vec![0.1f32, 0.2, 0.3, 0.4];

    let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
        logits: &logits,
        bias: None,
        batch_slots: &[0],
        end_ids: &h.end_ids,
        draft_logits: Some(&logits[..]),
        draft_token_ids: &[2],
        num_draft_tokens: &[1],
        use_draft_logits: &[true],
        step: 0,
        acceptance: AcceptanceThreshold::Random,
    });
    h.layer.forward(&mut h.buffers.as_outputs(), &inputs, &mut h.workspace).unwrap();

    // Ratio 1 passes any threshold in [0, 1), and accepted slots skip the bonus draw.
    assert!(h.layer.is_accepted(0));
    assert_eq!(h.layer.runtime().generators().draws(0), 1);
}

#[test]
fn draft_probabilities_reused_after_step_zero() {
    let domain = DecoderDomain::new(1, 4, 4, 2, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default());
    let logits = vec![0.0f32, 1.0, 2.0, 3.0];
    let draft_logits: Vec<f32> = logits.iter().chain(logits.iter()).copied().collect();

    for step in 0..2 {
        let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
            logits: &logits,
            bias: None,
            batch_slots: &[0],
            end_ids: &h.end_ids,
            draft_logits: if step == 0 { Some(&draft_logits[..]) } else { None },
            draft_token_ids: &[3, 3],
            num_draft_tokens: &[2],
            use_draft_logits: &[true],
            step,
            acceptance: AcceptanceThreshold::Constant(1.0),
        });
        h.layer.forward(&mut h.buffers.as_outputs(), &inputs, &mut h.workspace).unwrap();
    }
    assert_eq!(h.buffers.tokens(0), &[3, 3]);
}

#[test]
fn missing_draft_probabilities_rejected() {
    let domain = DecoderDomain::new(1, 4, 4, 2, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default());
    let logits = vec![0.0f32; 4];

    let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
        logits: &logits,
        bias: None,
        batch_slots: &[0],
        end_ids: &h.end_ids,
        draft_logits: None,
        draft_token_ids: &[1, 1],
        num_draft_tokens: &[2],
        use_draft_logits: &[true],
        step: 1,
        acceptance: AcceptanceThreshold::Constant(1.0),
    });
    let err = h.layer.forward(&mut h.buffers.as_outputs(), &inputs, &mut h.workspace).unwrap_err();
    assert!(matches!(err, DecodingError::InvalidArgument(_)));
}

#[test]
fn bias_applies_to_target_distribution() {
    let domain = DecoderDomain::new(1, 2, 2, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default());
    let logits = vec![0.0f32, 0.0];
    let bias = vec![0.0f32, 1.0];
    let draft_logits = vec![0.0f32, 1.0];

    let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
        logits: &logits,
        bias: Some(&bias[..]),
        batch_slots: &[0],
        end_ids: &h.end_ids,
        draft_logits: Some(&draft_logits[..]),
        draft_token_ids: &[1],
        num_draft_tokens: &[1],
        use_draft_logits: &[true],
        step: 0,
        acceptance: AcceptanceThreshold::Constant(1.0),
    });
    h.layer.forward(&mut h.buffers.as_outputs(), &inputs, &mut h.workspace).unwrap();

    // Biased target [0, 1] matches the draft, so the ratio is 1.
    let probs = h.layer.target_probs(0);
    assert!((probs[0] - 0.2689).abs() < 1e-3);
    assert!((probs[1] - 0.7311).abs() < 1e-3);
    assert!(h.layer.is_accepted(0));
    assert_eq!(h.buffers.tokens(0), &[1]);
    assert_eq!(h.buffers.finished[0], FinishedState::Running);
}

#[test]
fn unbiased_target_rejects_same_draft() {
    let domain = DecoderDomain::new(1, 2, 2, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default().with_seed(3));
    let logits = vec![0.0f32, 0.0];
    let draft_logits = vec![0.0f32, 1.0];

    let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
        logits: &logits,
        bias: None,
        batch_slots: &[0],
        end_ids: &h.end_ids,
        draft_logits: Some(&draft_logits[..]),
        draft_token_ids: &[1],
        num_draft_tokens: &[1],
        use_draft_logits: &[true],
        step: 0,
        acceptance: AcceptanceThreshold::Constant(1.0),
    });
    h.layer.forward(&mut h.buffers.as_outputs(), &inputs, &mut h.workspace).unwrap();

    // 0.5 / 0.731 falls short of the threshold.
    assert!((h.layer.target_probs(0)[1] - 0.5).abs() < 1e-6);
    assert!(!h.layer.is_accepted(0));
    assert_eq!(h.buffers.finished[0], FinishedState::SkipDecoding);
}

#[test]
fn new_cycle_clears_draft_probabilities_of_skipped_slots() {
    let domain = DecoderDomain::new(1, 4, 4, 2, 8).unwrap();
    let mut h = Harness::new(domain, &[0], SamplingSetupParams::default());
    let logits = peaked(4, 3);
    let draft_logits = rows(4, &[3, 3]);
    let run = |h: &mut Harness, step: usize, draft: Option<&[f32]>| {
        let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
            logits: &logits,
            bias: None,
            batch_slots: &[0],
            end_ids: &h.end_ids,
            draft_logits: draft,
            draft_token_ids: &[3, 3],
            num_draft_tokens: &[2],
            use_draft_logits: &[true],
            step,
            acceptance: AcceptanceThreshold::Constant(1.0),
        });
        h.layer.forward(&mut h.buffers.as_outputs(), &inputs, &mut h.workspace)
    };

    run(&mut h, 0, Some(&draft_logits[..])).unwrap();
    assert_eq!(h.buffers.tokens(0), &[3]);

    // The slot sits out step 0 of the next cycle, so its old draft
    // probabilities must not carry over into step 1.
    h.buffers.finished[0] = FinishedState::SkipDecoding;
    run(&mut h, 0, None).unwrap();
    reset_skip_decoding(&mut h.buffers.finished);

    let err = run(&mut h, 1, None).unwrap_err();
    assert!(matches!(err, DecodingError::InvalidArgument(_)));
    assert!(err.to_string().contains("never computed"));
    assert_eq!(h.buffers.tokens(0), &[3]);
}

#[test]
fn same_seed_same_bonus_tokens() {
    let domain = DecoderDomain::new(4, 16, 16, 1, 8).unwrap();
    let logits: Vec<f32> = (0..64).map(|i| ((i * 7) % 11) as f32 * 0.3).collect();
    let slots = [0, 1, 2, 3];
    // Drafts that never match the argmax force a bonus draw everywhere.
    let drafts = [15, 15, 15, 15];

    let run = || {
        let params = SamplingSetupParams::default().with_seeds(vec![1, 2, 3, 4]);
        let mut h = Harness::new(domain, &slots, params);
        h.step(&slots, &logits, &drafts, &[1; 4], 0).unwrap();
        slots.iter().map(|&s| h.buffers.tokens(s).to_vec()).collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

#[test]
fn dense_rows_follow_batch_slots() {
    let domain = DecoderDomain::new(3, 5, 5, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[2, 0], SamplingSetupParams::default().with_top_k(vec![1]));

    // Dense row 0 belongs to slot 2, row 1 to slot 0.
    let logits = rows(5, &[4, 1]);
    h.step(&[2, 0], &logits, &[1, 0, 4], &[1, 0, 1], 0).unwrap();

    assert_eq!(h.buffers.tokens(2), &[4]);
    assert_eq!(h.buffers.tokens(0), &[1]);
    assert!(h.buffers.tokens(1).is_empty());
}

#[test]
fn half_precision_logits_supported() {
    let domain = DecoderDomain::new(1, 4, 4, 1, 8).unwrap();
    let mode = DecodingMode::ExternalDraftTokens;
    let mut layer = ExternalDraftTokensLayer::new(mode, domain).unwrap();
    let mut workspace = Workspace::new(layer.workspace_size());
    let setup = SetupParams::ExternalDraftTokens(SamplingSetupParams::default());
    layer.setup(&[0], &setup, &mut workspace).unwrap();
    let mut buffers = SequenceBuffers::for_domain(&domain);

    let logits: Vec<f16> = [0.0f32, 3.0, 0.5, 0.0].iter().map(|&v| f16::from_f32(v)).collect();
    let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
        logits: &logits,
        bias: None,
        batch_slots: &[0],
        end_ids: &[NO_EOS],
        draft_logits: None,
        draft_token_ids: &[1],
        num_draft_tokens: &[1],
        use_draft_logits: &[false],
        step: 0,
        acceptance: AcceptanceThreshold::Random,
    });
    layer.forward(&mut buffers.as_outputs(), &inputs, &mut workspace).unwrap();
    assert_eq!(buffers.tokens(0), &[1]);
}

#[test]
fn malformed_inputs_rejected() {
    let domain = DecoderDomain::new(2, 5, 5, 1, 8).unwrap();
    let mut h = Harness::new(domain, &[0, 1], SamplingSetupParams::default());
    let logits = rows(5, &[1, 1]);

    // Duplicate slots.
    assert!(h.step(&[1, 1], &logits, &[1, 1], &[1, 1], 0).is_err());
    // Logits for one row only.
    assert!(h.step(&[0, 1], &logits[..5], &[1, 1], &[1, 1], 0).is_err());
    // Step past the draft length limit.
    assert!(h.step(&[0, 1], &logits, &[1, 1], &[1, 1], 2).is_err());
    // Draft token outside the vocabulary.
    assert!(h.step(&[0, 1], &logits, &[7, 1], &[1, 1], 0).is_err());
    // More drafts than the domain allows.
    assert!(h.step(&[0, 1], &logits, &[1, 1], &[2, 1], 0).is_err());

    assert_eq!(h.buffers.sequence_lengths, vec![0, 0]);
}
