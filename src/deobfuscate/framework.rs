//! Framework classification by weighted signature match over raw text.

// ============ Constants ============

/// Summed signature weight needed before a tag is emitted
const TAG_THRESHOLD: u32 = 2;

/// (tag, [(signature, weight)]); output order follows this table
const FRAMEWORK_SIGNATURES: &[(&str, &[(&str, u32)])] = &[
    (
        "react",
        &[
            ("React.createElement", 2),
            ("react-dom", 2),
            ("__SECRET_INTERNALS_DO_NOT_USE_OR_YOU_WILL_BE_FIRED", 2),
            ("react.element", 2),
            ("jsx-runtime", 2),
            ("useState(", 1),
            ("useEffect(", 1),
            ("_jsx(", 1),
            ("jsxs(", 1),
        ],
    ),
    (
        "vue",
        &[
            ("Vue.component", 2),
            ("__vue__", 2),
            ("_createElementVNode", 2),
            ("__VUE_OPTIONS_API__", 2),
            ("createApp(", 1),
            ("defineComponent(", 1),
            ("_openBlock(", 1),
        ],
    ),
    (
        "angular",
        &[
            ("ɵɵdefineComponent", 2),
            ("@angular/core", 2),
            ("ng-version", 2),
            ("ɵɵelementStart", 1),
        ],
    ),
    (
        "jquery",
        &[
            ("jQuery.fn", 2),
            ("jquery", 1),
            ("jQuery(", 1),
            ("$.ajax(", 1),
            ("$(document).ready", 2),
        ],
    ),
    (
        "webpack",
        &[
            ("__webpack_require__", 2),
            ("webpackChunk", 2),
            ("webpackJsonp", 2),
            ("__webpack_exports__", 2),
        ],
    ),
    (
        "svelte",
        &[("svelte/internal", 2), ("SvelteComponent", 2), ("$$props", 1)],
    ),
    (
        "lodash",
        &[("lodash", 1), ("_.debounce(", 1), ("_.cloneDeep(", 1), ("__lodash_hash_undefined__", 2)],
    ),
    (
        "nextjs",
        &[("__NEXT_DATA__", 2), ("next/router", 2), ("__next", 1)],
    ),
];

/// Classify raw source text into framework tags
pub fn classify(text: &str) -> Vec<String> {
    let mut tags = Vec::new();
    for (tag, signatures) in FRAMEWORK_SIGNATURES {
        let score: u32 = signatures
            .iter()
            .filter(|(needle, _)| text.contains(needle))
            .map(|(_, weight)| weight)
            .sum();
        if score >= TAG_THRESHOLD {
            tags.push(tag.to_string());
        }
    }
    tags
}
