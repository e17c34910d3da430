mod local;
mod util;
