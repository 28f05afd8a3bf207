fn main() {
    quotio::run();
}
